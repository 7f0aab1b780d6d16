//! Algorithm identifiers and candidate ranking
//!
//! The string form of each identifier is also the algorithm name kernels are
//! compiled under, so search and dispatch locate the same program.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{Error, Result};
use crate::solver::Direction;

/// Strategy family an algorithm is built by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StrategyFamily {
    Gemm,
    Winograd,
    Direct,
    Fft,
}

/// An algorithm identifier for one direction
pub trait ConvAlgorithm:
    Copy + fmt::Debug + fmt::Display + FromStr + PartialEq + Serialize + DeserializeOwned
{
    const DIRECTION: Direction;

    /// Name kernels for this algorithm are compiled under
    fn name(self) -> &'static str;

    fn family(self) -> StrategyFamily;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum ConvFwdAlgorithm {
    #[strum(serialize = "conv_fwd_gemm")]
    Gemm,
    #[strum(serialize = "conv_fwd_direct")]
    Direct,
    #[strum(serialize = "conv_fwd_fft")]
    Fft,
    #[strum(serialize = "conv_fwd_winograd")]
    Winograd,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum ConvBwdDataAlgorithm {
    #[strum(serialize = "conv_bwd_data_gemm")]
    Gemm,
    #[strum(serialize = "conv_bwd_data_direct")]
    Direct,
    #[strum(serialize = "conv_bwd_data_fft")]
    Fft,
    #[strum(serialize = "conv_bwd_data_winograd")]
    Winograd,
    /// GEMM for the data gradient of a transpose-mode convolution
    #[strum(serialize = "transpose_bwd_data_gemm")]
    TransposeGemm,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum ConvBwdWeightsAlgorithm {
    #[strum(serialize = "conv_bwd_weights_gemm")]
    Gemm,
    #[strum(serialize = "conv_bwd_weights_direct")]
    Direct,
}

macro_rules! impl_conv_algorithm {
    ($ty:ty, $direction:expr, { $($variant:ident => $family:ident),+ $(,)? }) => {
        impl ConvAlgorithm for $ty {
            const DIRECTION: Direction = $direction;

            fn name(self) -> &'static str {
                self.into()
            }

            fn family(self) -> StrategyFamily {
                match self {
                    $(Self::$variant => StrategyFamily::$family,)+
                }
            }
        }
    };
}

impl_conv_algorithm!(ConvFwdAlgorithm, Direction::Forward, {
    Gemm => Gemm,
    Direct => Direct,
    Fft => Fft,
    Winograd => Winograd,
});
impl_conv_algorithm!(ConvBwdDataAlgorithm, Direction::BackwardData, {
    Gemm => Gemm,
    Direct => Direct,
    Fft => Fft,
    Winograd => Winograd,
    TransposeGemm => Gemm,
});
impl_conv_algorithm!(ConvBwdWeightsAlgorithm, Direction::BackwardWeights, {
    Gemm => Gemm,
    Direct => Direct,
});

/// One benchmarked strategy
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmCandidate {
    pub name: &'static str,
    /// Measured device time in milliseconds
    pub time: f32,
    /// Workspace bytes the strategy needs
    pub workspace: usize,
}

impl AlgorithmCandidate {
    pub fn new<A: ConvAlgorithm>(algorithm: A, time: f32, workspace: usize) -> Self {
        Self {
            name: algorithm.name(),
            time,
            workspace,
        }
    }
}

/// A ranked search result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerfResult<A> {
    pub algorithm: A,
    /// Milliseconds, or 0 when served from the find cache
    pub time: f32,
    /// Workspace bytes, or 0 when served from the find cache
    pub memory: usize,
}

/// Order candidates by time, keeping discovery order on ties, and keep the
/// best `request_count`
pub fn rank<A: ConvAlgorithm>(
    mut candidates: Vec<AlgorithmCandidate>,
    request_count: usize,
) -> Result<Vec<PerfResult<A>>> {
    candidates.sort_by(|a, b| a.time.total_cmp(&b.time));
    candidates
        .into_iter()
        .take(request_count)
        .map(|candidate| {
            let algorithm = A::from_str(candidate.name).map_err(|_| {
                Error::bad_param(format!(
                    "{} is not a {} algorithm",
                    candidate.name,
                    A::DIRECTION
                ))
            })?;
            Ok(PerfResult {
                algorithm,
                time: candidate.time,
                memory: candidate.workspace,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for algo in ConvBwdDataAlgorithm::iter() {
            assert_eq!(ConvBwdDataAlgorithm::from_str(algo.name()).unwrap(), algo);
        }
        assert_eq!(ConvFwdAlgorithm::Winograd.to_string(), "conv_fwd_winograd");
        assert!(ConvBwdWeightsAlgorithm::from_str("conv_fwd_gemm").is_err());
    }

    #[test]
    fn test_families() {
        assert_eq!(ConvBwdDataAlgorithm::TransposeGemm.family(), StrategyFamily::Gemm);
        assert_eq!(ConvFwdAlgorithm::Winograd.family(), StrategyFamily::Winograd);
        assert_eq!(ConvBwdWeightsAlgorithm::Direct.family(), StrategyFamily::Direct);
    }

    #[test]
    fn test_rank_is_stable_and_truncates() {
        let candidates = vec![
            AlgorithmCandidate::new(ConvFwdAlgorithm::Gemm, 2.0, 64),
            AlgorithmCandidate::new(ConvFwdAlgorithm::Winograd, 1.0, 0),
            AlgorithmCandidate::new(ConvFwdAlgorithm::Direct, 2.0, 0),
            AlgorithmCandidate::new(ConvFwdAlgorithm::Fft, 3.0, 128),
        ];
        let ranked = rank::<ConvFwdAlgorithm>(candidates.clone(), 3).unwrap();
        let order: Vec<_> = ranked.iter().map(|r| r.algorithm).collect();
        assert_eq!(
            order,
            vec![
                ConvFwdAlgorithm::Winograd,
                ConvFwdAlgorithm::Gemm,
                ConvFwdAlgorithm::Direct
            ]
        );
        assert_eq!(ranked[1].memory, 64);
        assert_eq!(rank::<ConvFwdAlgorithm>(candidates, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_rank_rejects_foreign_names() {
        let candidates = vec![AlgorithmCandidate::new(ConvFwdAlgorithm::Gemm, 1.0, 0)];
        assert!(rank::<ConvBwdWeightsAlgorithm>(candidates, 1).is_err());
    }
}
