use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use serde::{Deserialize, Serialize};

/// Protocol providers expose to enumerate their retrieval endpoints.
pub const TRANSPORTS_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/fil/retrieval/transports/1.0.0");

/// Upper bound on a transports listing.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// A CBOR byte string. Plain `Vec<u8>` round-trips as an integer array,
/// which providers do not send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrBytes(pub Vec<u8>);

impl Serialize for AddrBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for AddrBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = AddrBytes;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(AddrBytes(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(AddrBytes(v))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::new();
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(AddrBytes(bytes))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// One advertised retrieval transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalProtocol {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<AddrBytes>,
}

impl RetrievalProtocol {
    pub fn address_bytes(&self) -> Vec<Vec<u8>> {
        self.addresses.iter().map(|addr| addr.0.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "Protocols", default)]
    pub protocols: Vec<RetrievalProtocol>,
}

/// Opening the stream is the whole request: the provider immediately
/// writes back one varint-length-prefixed CBOR listing.
#[derive(Debug, Clone, Default)]
pub struct TransportsCodec;

#[async_trait]
impl request_response::Codec for TransportsCodec {
    type Protocol = StreamProtocol;
    type Request = ();
    type Response = QueryResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, _: &mut T) -> std::io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<QueryResponse>
    where
        T: AsyncRead + Unpin + Send,
    {
        let message = read_length_prefixed(io, MAX_MESSAGE_SIZE).await?;
        ciborium::from_reader(message.as_slice())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        _: Self::Request,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.flush().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        _: &mut T,
        _: Self::Response,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(())
    }
}

/// Reads one varint-length-prefixed frame, bounded by `max_size`.
pub(crate) async fn read_length_prefixed<T: AsyncRead + Unpin + Send>(
    io: &mut T,
    max_size: usize,
) -> std::io::Result<Vec<u8>> {
    let len = unsigned_varint::aio::read_usize(&mut *io)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_size} byte cap"),
        ));
    }

    let mut buf = vec![0_u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one varint-length-prefixed frame.
pub(crate) async fn write_length_prefixed<T: AsyncWrite + Unpin + Send>(
    io: &mut T,
    frame: &[u8],
) -> std::io::Result<()> {
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(frame.len(), &mut len_buf))
        .await?;
    io.write_all(frame).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_response_decodes_cbor_byte_strings() {
        let addr: multiaddr::Multiaddr = "/ip4/10.0.0.1/tcp/8080/http".parse().unwrap();
        let response = QueryResponse {
            protocols: vec![
                RetrievalProtocol {
                    name: "http".to_string(),
                    addresses: vec![AddrBytes(addr.to_vec())],
                },
                RetrievalProtocol {
                    name: "bitswap".to_string(),
                    addresses: vec![],
                },
            ],
        };

        let mut encoded = Vec::new();
        ciborium::into_writer(&response, &mut encoded).unwrap();
        let decoded: QueryResponse = ciborium::from_reader(encoded.as_slice()).unwrap();

        assert_eq!(decoded.protocols.len(), 2);
        assert_eq!(decoded.protocols[0].name, "http");
        assert_eq!(decoded.protocols[0].address_bytes(), vec![addr.to_vec()]);
    }

    #[test]
    fn frames_round_trip() {
        futures::executor::block_on(async {
            let mut buf = Vec::new();
            write_length_prefixed(&mut buf, b"listing").await.unwrap();

            let mut cursor = futures::io::Cursor::new(buf);
            let frame = read_length_prefixed(&mut cursor, 1024).await.unwrap();
            assert_eq!(frame, b"listing");
        });
    }

    #[test]
    fn oversized_frames_are_rejected() {
        futures::executor::block_on(async {
            let mut buf = Vec::new();
            write_length_prefixed(&mut buf, &[0_u8; 64]).await.unwrap();

            let mut cursor = futures::io::Cursor::new(buf);
            assert!(read_length_prefixed(&mut cursor, 16).await.is_err());
        });
    }
}
