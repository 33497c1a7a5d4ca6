//! Systematic Reed-Solomon erasure code
//!
//! The encoding matrix is the K×K identity stacked on an M×K Cauchy matrix,
//! so every K-row subset is invertible: any K of the K+M shards rebuild the
//! K data shards.

use super::gf256;
use thiserror::Error;

/// Upper bound on K+M so shard indices fit in one byte
pub const MAX_TOTAL_SHARDS: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErasureError {
    #[error("invalid shard counts: {data} data, {parity} parity")]
    InvalidShardCount { data: usize, parity: usize },

    #[error("expected {expected} shards, got {actual}")]
    WrongShardCount { expected: usize, actual: usize },

    #[error("shards have differing sizes")]
    ShardSizeMismatch,

    #[error("too few shards: need {need}, have {have}")]
    TooFewShards { need: usize, have: usize },

    #[error("decode matrix is singular")]
    Singular,
}

/// K-of-(K+M) erasure code
///
/// `encode` derives the M parity shards from K equally sized data shards;
/// `reconstruct_data` fills every missing data shard once at least K shards
/// of the group (data or parity, identified by position) are present.
pub trait ErasureCoder: Send + Sync {
    fn data_shards(&self) -> usize;

    fn parity_shards(&self) -> usize;

    fn total_shards(&self) -> usize {
        self.data_shards() + self.parity_shards()
    }

    fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, ErasureError>;

    fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), ErasureError>;
}

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    data: usize,
    parity: usize,
    /// M rows of K Cauchy coefficients
    parity_rows: Vec<Vec<u8>>,
}

impl ReedSolomon {
    pub fn new(data: usize, parity: usize) -> Result<Self, ErasureError> {
        if data == 0 || parity == 0 || data + parity > MAX_TOTAL_SHARDS {
            return Err(ErasureError::InvalidShardCount { data, parity });
        }

        // x_i = K + i and y_j = j never collide, so x_i ^ y_j != 0.
        let parity_rows = (0..parity)
            .map(|i| {
                (0..data)
                    .map(|j| gf256::inv(((data + i) as u8) ^ (j as u8)))
                    .collect()
            })
            .collect();

        Ok(Self {
            data,
            parity,
            parity_rows,
        })
    }

    /// Row of the encoding matrix that produces shard `index`
    fn encoding_row(&self, index: usize) -> Vec<u8> {
        if index < self.data {
            let mut row = vec![0u8; self.data];
            row[index] = 1;
            row
        } else {
            self.parity_rows[index - self.data].clone()
        }
    }
}

impl ErasureCoder for ReedSolomon {
    fn data_shards(&self) -> usize {
        self.data
    }

    fn parity_shards(&self) -> usize {
        self.parity
    }

    fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if data.len() != self.data {
            return Err(ErasureError::WrongShardCount {
                expected: self.data,
                actual: data.len(),
            });
        }
        let len = data[0].len();
        if data.iter().any(|shard| shard.len() != len) {
            return Err(ErasureError::ShardSizeMismatch);
        }

        let parity = self
            .parity_rows
            .iter()
            .map(|row| {
                let mut out = vec![0u8; len];
                for (coef, shard) in row.iter().zip(data) {
                    gf256::mul_acc(&mut out, shard, *coef);
                }
                out
            })
            .collect();
        Ok(parity)
    }

    fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), ErasureError> {
        if shards.len() != self.total_shards() {
            return Err(ErasureError::WrongShardCount {
                expected: self.total_shards(),
                actual: shards.len(),
            });
        }

        let missing: Vec<usize> = (0..self.data).filter(|&i| shards[i].is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let present: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .take(self.data)
            .collect();
        if present.len() < self.data {
            return Err(ErasureError::TooFewShards {
                need: self.data,
                have: present.len(),
            });
        }

        let len = shards[present[0]].as_ref().map_or(0, Vec::len);
        if present
            .iter()
            .any(|&i| shards[i].as_ref().map_or(0, Vec::len) != len)
        {
            return Err(ErasureError::ShardSizeMismatch);
        }

        let sub: Vec<Vec<u8>> = present.iter().map(|&i| self.encoding_row(i)).collect();
        let decode = gf256::invert_matrix(&sub).ok_or(ErasureError::Singular)?;

        let mut rebuilt = Vec::with_capacity(missing.len());
        for &target in &missing {
            let mut out = vec![0u8; len];
            for (coef, &src) in decode[target].iter().zip(&present) {
                if let Some(shard) = shards[src].as_ref() {
                    gf256::mul_acc(&mut out, shard, *coef);
                }
            }
            rebuilt.push((target, out));
        }
        for (target, out) in rebuilt {
            shards[target] = Some(out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|j| (i * 31 + j * 17 + 3) as u8).collect())
            .collect()
    }

    fn full_group(rs: &ReedSolomon, data: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let mut all = data.to_vec();
        all.extend(rs.encode(&refs).unwrap());
        all
    }

    #[test]
    fn test_any_two_of_six_lost() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data = sample_data(4, 64);
        let all = full_group(&rs, &data);

        for a in 0..6 {
            for b in (a + 1)..6 {
                let mut shards: Vec<Option<Vec<u8>>> = all.iter().cloned().map(Some).collect();
                shards[a] = None;
                shards[b] = None;
                rs.reconstruct_data(&mut shards).unwrap();
                for i in 0..4 {
                    assert_eq!(shards[i].as_ref().unwrap(), &data[i], "lost {} and {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_three_lost_is_unrecoverable() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let all = full_group(&rs, &sample_data(4, 16));

        let mut shards: Vec<Option<Vec<u8>>> = all.into_iter().map(Some).collect();
        shards[0] = None;
        shards[2] = None;
        shards[5] = None;
        assert_eq!(
            rs.reconstruct_data(&mut shards),
            Err(ErasureError::TooFewShards { need: 4, have: 3 })
        );
    }

    #[test]
    fn test_single_parity_recovers_each_shard() {
        let rs = ReedSolomon::new(3, 1).unwrap();
        let data = sample_data(3, 10);
        let all = full_group(&rs, &data);

        for lost in 0..3 {
            let mut shards: Vec<Option<Vec<u8>>> = all.iter().cloned().map(Some).collect();
            shards[lost] = None;
            rs.reconstruct_data(&mut shards).unwrap();
            assert_eq!(shards[lost].as_ref().unwrap(), &data[lost]);
        }
    }

    #[test]
    fn test_wide_group() {
        let rs = ReedSolomon::new(20, 10).unwrap();
        let data = sample_data(20, 32);
        let all = full_group(&rs, &data);

        let mut shards: Vec<Option<Vec<u8>>> = all.into_iter().map(Some).collect();
        for i in (0..20).step_by(2) {
            shards[i] = None;
        }
        rs.reconstruct_data(&mut shards).unwrap();
        for i in 0..20 {
            assert_eq!(shards[i].as_ref().unwrap(), &data[i]);
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ReedSolomon::new(0, 2).is_err());
        assert!(ReedSolomon::new(4, 0).is_err());
        assert!(ReedSolomon::new(200, 56).is_err());
        assert!(ReedSolomon::new(200, 55).is_ok());

        let rs = ReedSolomon::new(2, 1).unwrap();
        assert_eq!(
            rs.encode(&[b"ab".as_slice(), b"abc".as_slice()]),
            Err(ErasureError::ShardSizeMismatch)
        );
    }
}
