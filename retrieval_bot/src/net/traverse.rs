use cid::Cid;
use prost::Message as _;

use crate::net::pb;

pub const RAW_CODEC: u64 = 0x55;
pub const DAG_PB_CODEC: u64 = 0x70;
pub const DAG_CBOR_CODEC: u64 = 0x71;
pub const DAG_JOSE_CODEC: u64 = 0x85;
pub const DAG_JSON_CODEC: u64 = 0x0129;

/// Codecs the generators accept as evidence that a deal label is a
/// payload CID.
pub const PAYLOAD_CODECS: [u64; 5] = [
    RAW_CODEC,
    DAG_PB_CODEC,
    DAG_CBOR_CODEC,
    DAG_JOSE_CODEC,
    DAG_JSON_CODEC,
];

#[derive(Debug, thiserror::Error)]
pub enum TraverseError {
    #[error("no decoder registered for multicodec code {0:#x}")]
    UnsupportedCodec(u64),

    #[error("cannot decode links: {0}")]
    DecodeFailure(String),
}

/// Extracts the child links of a block, choosing the decoder by the
/// block CID's codec. Raw blocks are leaves and have no links.
pub fn decode_links(cid: &Cid, data: &[u8]) -> Result<Vec<Cid>, TraverseError> {
    match cid.codec() {
        RAW_CODEC => Ok(vec![]),
        DAG_PB_CODEC => decode_pb_links(data),
        DAG_CBOR_CODEC | DAG_JOSE_CODEC => decode_cbor_links(data),
        DAG_JSON_CODEC => decode_json_links(data),
        other => Err(TraverseError::UnsupportedCodec(other)),
    }
}

fn decode_pb_links(data: &[u8]) -> Result<Vec<Cid>, TraverseError> {
    let node = pb::PbNode::decode(data)
        .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;

    let mut links = Vec::with_capacity(node.links.len());
    for link in node.links {
        let hash = link
            .hash
            .ok_or_else(|| TraverseError::DecodeFailure("link without hash".to_string()))?;
        let cid = Cid::try_from(hash.as_slice())
            .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;
        links.push(cid);
    }
    Ok(links)
}

/// dag-cbor links are CBOR tag 42 wrapping an identity-multibase-prefixed
/// CID byte string.
fn decode_cbor_links(data: &[u8]) -> Result<Vec<Cid>, TraverseError> {
    let value: ciborium::Value = ciborium::from_reader(data)
        .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;

    let mut links = Vec::new();
    collect_cbor_links(&value, &mut links)?;
    Ok(links)
}

fn collect_cbor_links(value: &ciborium::Value, links: &mut Vec<Cid>) -> Result<(), TraverseError> {
    match value {
        ciborium::Value::Tag(42, inner) => {
            let ciborium::Value::Bytes(bytes) = inner.as_ref() else {
                return Err(TraverseError::DecodeFailure(
                    "tag 42 without a byte string".to_string(),
                ));
            };
            if bytes.first() != Some(&0) {
                return Err(TraverseError::DecodeFailure(
                    "link missing identity multibase prefix".to_string(),
                ));
            }
            let cid = Cid::try_from(&bytes[1..])
                .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;
            links.push(cid);
        }
        ciborium::Value::Array(items) => {
            for item in items {
                collect_cbor_links(item, links)?;
            }
        }
        ciborium::Value::Map(entries) => {
            for (_, item) in entries {
                collect_cbor_links(item, links)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// dag-json links are `{"/": "<cid>"}` objects.
fn decode_json_links(data: &[u8]) -> Result<Vec<Cid>, TraverseError> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;

    let mut links = Vec::new();
    collect_json_links(&value, &mut links)?;
    Ok(links)
}

fn collect_json_links(value: &serde_json::Value, links: &mut Vec<Cid>) -> Result<(), TraverseError> {
    match value {
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(cid)) = map.get("/") {
                    let cid = cid
                        .parse::<Cid>()
                        .map_err(|err| TraverseError::DecodeFailure(err.to_string()))?;
                    links.push(cid);
                    return Ok(());
                }
            }
            for item in map.values() {
                collect_json_links(item, links)?;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_json_links(item, links)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    fn raw_cid(data: &[u8]) -> Cid {
        Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(data))
    }

    fn cid_with_codec(codec: u64) -> Cid {
        Cid::new_v1(codec, Code::Sha2_256.digest(b"node"))
    }

    #[test]
    fn raw_blocks_are_leaves() {
        let cid = raw_cid(b"leaf");
        assert!(decode_links(&cid, b"leaf").unwrap().is_empty());
    }

    #[test]
    fn unknown_codecs_are_rejected() {
        let cid = cid_with_codec(0x99);
        assert!(matches!(
            decode_links(&cid, b""),
            Err(TraverseError::UnsupportedCodec(0x99))
        ));
    }

    #[test]
    fn dag_cbor_links_decode() {
        let child_a = raw_cid(b"a");
        let child_b = raw_cid(b"b");
        let as_tag = |cid: &Cid| {
            let mut bytes = vec![0_u8];
            bytes.extend_from_slice(&cid.to_bytes());
            ciborium::Value::Tag(42, Box::new(ciborium::Value::Bytes(bytes)))
        };

        let node = ciborium::Value::Map(vec![
            (
                ciborium::Value::Text("links".to_string()),
                ciborium::Value::Array(vec![as_tag(&child_a), as_tag(&child_b)]),
            ),
            (
                ciborium::Value::Text("name".to_string()),
                ciborium::Value::Text("dir".to_string()),
            ),
        ]);
        let mut data = Vec::new();
        ciborium::into_writer(&node, &mut data).unwrap();

        let cid = cid_with_codec(DAG_CBOR_CODEC);
        assert_eq!(decode_links(&cid, &data).unwrap(), vec![child_a, child_b]);
    }

    #[test]
    fn dag_pb_links_decode() {
        let child = raw_cid(b"child");
        let node = pb::PbNode {
            data: None,
            links: vec![pb::PbLink {
                hash: Some(child.to_bytes()),
                name: Some("0".to_string()),
                tsize: Some(42),
            }],
        };
        let data = node.encode_to_vec();

        let cid = cid_with_codec(DAG_PB_CODEC);
        assert_eq!(decode_links(&cid, &data).unwrap(), vec![child]);
    }

    #[test]
    fn dag_json_links_decode() {
        let child = raw_cid(b"child");
        let data = serde_json::to_vec(&serde_json::json!({
            "Links": [{"/": child.to_string()}],
            "Name": "dir"
        }))
        .unwrap();

        let cid = cid_with_codec(DAG_JSON_CODEC);
        assert_eq!(decode_links(&cid, &data).unwrap(), vec![child]);
    }

    #[test]
    fn garbage_input_is_a_decode_failure() {
        let cid = cid_with_codec(DAG_CBOR_CODEC);
        assert!(matches!(
            decode_links(&cid, &[0xff, 0x00, 0x13]),
            Err(TraverseError::DecodeFailure(_))
        ));
    }
}
