//! Seeded train/validation split of a record store.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::dataset::manifest::RecordStore;
use crate::utils::error::{Result, SorghumError};

/// Split `store` into `(train, validation)`.
///
/// The training side gets `floor(len * (1 - val_fraction))` records; both
/// sides share the source vocabulary.
pub fn train_val_split(
    store: &RecordStore,
    val_fraction: f64,
    seed: u64,
) -> Result<(RecordStore, RecordStore)> {
    if !(0.0..1.0).contains(&val_fraction) {
        return Err(SorghumError::Config(format!(
            "val_fraction must be in [0, 1), got {}",
            val_fraction
        )));
    }

    let mut indices: Vec<usize> = (0..store.len()).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_train = (store.len() as f64 * (1.0 - val_fraction)).floor() as usize;
    let (train, val) = indices.split_at(n_train);

    tracing::debug!(
        "Split {} records into {} train / {} validation (seed {})",
        store.len(),
        train.len(),
        val.len(),
        seed
    );

    Ok((store.select(train)?, store.select(val)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::manifest::DatasetMode;
    use std::path::Path;

    fn store(n: usize) -> RecordStore {
        let mut csv = String::from("image,cultivar\n");
        for i in 0..n {
            csv.push_str(&format!("img_{}.png,PI_{}\n", i, i % 4));
        }
        RecordStore::from_reader(csv.as_bytes(), Path::new("/data"), DatasetMode::Training).unwrap()
    }

    #[test]
    fn test_eighty_twenty() {
        let (train, val) = train_val_split(&store(10), 0.2, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let source = store(25);
        let (train, val) = train_val_split(&source, 0.2, 7).unwrap();

        let mut paths: Vec<_> = train
            .records()
            .iter()
            .chain(val.records())
            .map(|r| r.image_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 25);
    }

    #[test]
    fn test_reproducibility() {
        let source = store(30);
        let (a, _) = train_val_split(&source, 0.2, 42).unwrap();
        let (b, _) = train_val_split(&source, 0.2, 42).unwrap();
        assert_eq!(a.records(), b.records());
    }

    #[test]
    fn test_invalid_fraction() {
        assert!(train_val_split(&store(4), 1.0, 0).is_err());
        assert!(train_val_split(&store(4), -0.1, 0).is_err());
    }
}
