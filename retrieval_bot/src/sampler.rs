use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::model::DealState;

/// Sampler weight for one deal: old deals decay exponentially with the
/// aging base, large pieces count more, and heavy clients are damped by
/// the square root of their total live bytes. Clients missing from the
/// totals map weigh zero.
pub fn weight(deal: &DealState, c: f64, total_per_client: &HashMap<String, i64>) -> f64 {
    let Some(total) = total_per_client.get(&deal.client) else {
        return 0.0;
    };

    c.powf(-deal.age_in_years()) * deal.piece_size as f64 / (*total as f64).sqrt()
}

/// Selects up to `l` distinct deals, each draw proportional to its
/// weight, without replacement. A draw walks the slice subtracting
/// weights from a random residue; the deal that drives it to zero or
/// below is picked. A draw whose residue never reaches zero selects
/// nothing and is not backfilled.
pub fn random_objects<R: Rng>(
    rng: &mut R,
    deals: &[DealState],
    l: usize,
    c: f64,
    total_per_client: &HashMap<String, i64>,
) -> Vec<DealState> {
    let sum: f64 = deals
        .iter()
        .map(|deal| weight(deal, c, total_per_client))
        .sum();

    let mut selected: HashSet<u64> = HashSet::new();
    let mut results = Vec::new();
    if sum <= 0.0 {
        return results;
    }

    for _ in 0..l {
        let mut rand_num = rng.random::<f64>() * sum;

        for deal in deals {
            if selected.contains(&deal.deal_id) {
                continue;
            }
            rand_num -= weight(deal, c, total_per_client);
            if rand_num <= 0.0 {
                results.push(deal.clone());
                selected.insert(deal.deal_id);
                break;
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn deal(deal_id: u64, client: &str, piece_size: i64, age_days: i64) -> DealState {
        let sector_start = Utc::now() - Duration::days(age_days);
        DealState {
            deal_id,
            piece_cid: format!("baga-{deal_id}"),
            piece_size,
            label: String::new(),
            verified: true,
            client: client.to_string(),
            provider: "f0999".to_string(),
            start: sector_start,
            expiration: Utc::now() + Duration::days(100),
            sector_start,
            slashed: crate::epoch::epoch_to_time(-1),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn weights_follow_age_size_and_client_totals() {
        let totals = HashMap::from([
            ("a".to_string(), 16_i64),
            ("b".to_string(), 1600),
            ("c".to_string(), 160000),
        ]);

        assert!((weight(&deal(1, "a", 100, 0), 2.0, &totals) - 25.0).abs() < 0.1);
        assert!((weight(&deal(2, "a", 200, 0), 2.0, &totals) - 50.0).abs() < 0.1);
        assert!((weight(&deal(3, "a", 100, 365), 2.0, &totals) - 12.5).abs() < 0.1);
        assert!((weight(&deal(4, "b", 100, 0), 2.0, &totals) - 2.5).abs() < 0.1);
        assert!((weight(&deal(5, "c", 100, 0), 2.0, &totals) - 0.25).abs() < 0.1);
    }

    #[test]
    fn unknown_clients_weigh_zero() {
        let totals = HashMap::new();
        assert_eq!(weight(&deal(1, "a", 100, 0), 2.0, &totals), 0.0);
    }

    #[test]
    fn selection_is_distinct_and_bounded() {
        let totals = HashMap::from([("a".to_string(), 1_i64)]);
        let deals: Vec<DealState> = (1..=30)
            .map(|id| deal(id, "a", 1, if id > 10 { 365 } else { 0 }))
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        let selected = random_objects(&mut rng, &deals, 15, 2.0, &totals);

        assert!(selected.len() <= 15);
        let mut seen = HashSet::new();
        for deal in &selected {
            assert!(seen.insert(deal.deal_id), "duplicate deal {}", deal.deal_id);
        }
    }

    #[test]
    fn zero_total_weight_selects_nothing() {
        let totals = HashMap::new();
        let deals = vec![deal(1, "a", 100, 0)];
        let mut rng = StdRng::seed_from_u64(1);
        assert!(random_objects(&mut rng, &deals, 5, 2.0, &totals).is_empty());
    }

    #[test]
    fn empirical_ratio_tracks_weights() {
        // two deals with a 2:1 weight ratio by piece size
        let totals = HashMap::from([("a".to_string(), 1_i64)]);
        let deals = vec![deal(1, "a", 200, 0), deal(2, "a", 100, 0)];

        let mut rng = StdRng::seed_from_u64(42);
        let mut first_counts = 0_u32;
        let rounds = 30_000;
        for _ in 0..rounds {
            let selected = random_objects(&mut rng, &deals, 1, 2.0, &totals);
            if selected.len() == 1 && selected[0].deal_id == 1 {
                first_counts += 1;
            }
        }

        let ratio = first_counts as f64 / rounds as f64;
        assert!(
            (ratio - 2.0 / 3.0).abs() < 0.02,
            "expected ~0.667, got {ratio}"
        );
    }
}
