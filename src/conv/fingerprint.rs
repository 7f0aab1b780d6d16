use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conv::params::ConvParams;
use crate::error::Result;
use crate::solver::Direction;
use crate::tensor::TensorDesc;

/// Canonical key of a convolution problem
///
/// Keys both the per-direction find caches and the device's kernel cache, so
/// every property that changes the chosen kernel or its workspace is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigFingerprint(String);

fn push_strides(key: &mut String, tag: &str, desc: &TensorDesc) {
    if !desc.is_packed() {
        let strides: Vec<String> = desc.strides().iter().map(|s| s.to_string()).collect();
        key.push_str(&format!("-{}s{}", tag, strides.join("x")));
    }
}

impl ConfigFingerprint {
    /// `input` is x (or dx) and `output` is y (or dy) whatever the direction
    pub fn new(
        direction: Direction,
        input: &TensorDesc,
        weights: &TensorDesc,
        output: &TensorDesc,
        params: &ConvParams,
    ) -> Result<Self> {
        let (n, c, h, w) = input.dims4()?;
        let (wk, wc, kh, kw) = weights.dims4()?;
        let (on, oc, oh, ow) = output.dims4()?;

        let mut key = format!(
            "{}-{}-{}-{}x{}x{}x{}-{}x{}x{}x{}-{}x{}x{}x{}-p{}x{}-s{}x{}-d{}x{}-{}",
            direction,
            params.mode(),
            params.padding_mode(),
            n,
            c,
            h,
            w,
            wk,
            wc,
            kh,
            kw,
            on,
            oc,
            oh,
            ow,
            params.pad_h(),
            params.pad_w(),
            params.stride_h(),
            params.stride_w(),
            params.dilation_h(),
            params.dilation_w(),
            input.data_type().tag(),
        );
        push_strides(&mut key, "i", input);
        push_strides(&mut key, "w", weights);
        push_strides(&mut key, "o", output);
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
