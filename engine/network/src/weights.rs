//! Weight-file loading.
//!
//! Three on-disk formats yield the same in-memory vectors: v1 and v2 are
//! whitespace-separated text (v2 differing only in the value-head
//! convention), v3 is binary with a `3LZW\n` magic and optional 16-bit
//! floats. Files may be gzip-wrapped; decompression is transparent.
//!
//! Batch-norm variances are converted to `1 / sqrt(var + eps)` at load time
//! so the forward path multiplies instead of dividing. Any non-finite
//! weight rejects the file.

use crate::network::{NUM_INTERSECTIONS, OUTPUTS_POLICY, OUTPUTS_VALUE, VALUE_HIDDEN};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Channels of the input plane stack times the 3x3 filter footprint.
const INPUT_LAYER_WEIGHTS_PER_FILTER: usize = crate::network::INPUT_CHANNELS * 9;

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("could not open weights file: {0}")]
    Io(#[from] std::io::Error),

    #[error("weights file is the wrong version")]
    WrongVersion,

    #[error("failed to parse weights file: {0}")]
    Format(String),

    #[error("non-finite weight in weights file at offset {0}")]
    NonFinite(usize),
}

/// Parsed network weights, ready for the Winograd transform.
#[derive(Debug, Clone)]
pub struct WeightFile {
    pub channels: usize,
    pub residual_blocks: usize,
    /// True when the value head reports Black's winrate instead of the
    /// side to move (the v2 convention).
    pub value_head_not_stm: bool,

    /// One entry per convolution: input layer first, then two per block.
    pub conv_weights: Vec<Vec<f32>>,
    pub conv_biases: Vec<Vec<f32>>,
    pub batchnorm_means: Vec<Vec<f32>>,
    /// Stored as `1 / sqrt(var + eps)`.
    pub batchnorm_stddevs: Vec<Vec<f32>>,

    pub conv_pol_w: Vec<f32>,
    pub conv_pol_b: Vec<f32>,
    pub bn_pol_w1: Vec<f32>,
    pub bn_pol_w2: Vec<f32>,
    pub ip_pol_w: Vec<f32>,
    pub ip_pol_b: Vec<f32>,

    pub conv_val_w: Vec<f32>,
    pub conv_val_b: Vec<f32>,
    pub bn_val_w1: Vec<f32>,
    pub bn_val_w2: Vec<f32>,
    pub ip1_val_w: Vec<f32>,
    pub ip1_val_b: Vec<f32>,
    pub ip2_val_w: Vec<f32>,
    pub ip2_val_b: Vec<f32>,
}

/// In-place `var -> 1 / sqrt(var + eps)`.
fn process_bn_var(weights: &mut [f32]) {
    const EPSILON: f32 = 1e-5;
    for w in weights.iter_mut() {
        *w = 1.0 / (*w + EPSILON).sqrt();
    }
}

/// Decode an IEEE 754 binary16 value.
fn half_to_f32(bits: u16) -> f32 {
    let sign = if bits >> 15 == 1 { -1.0f32 } else { 1.0 };
    let exponent = (bits >> 10) & 0x1f;
    let mantissa = bits & 0x3ff;
    match exponent {
        0 => sign * mantissa as f32 / (1 << 24) as f32,
        0x1f => {
            if mantissa == 0 {
                sign * f32::INFINITY
            } else {
                f32::NAN
            }
        }
        e => sign * (1.0 + mantissa as f32 / 1024.0) * 2.0f32.powi(e as i32 - 15),
    }
}

fn maybe_gunzip(raw: Vec<u8>) -> Result<Vec<u8>, WeightsError> {
    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut out = Vec::new();
        GzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .map_err(|e| WeightsError::Format(format!("failed to decompress: {}", e)))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

/// Byte reader for the v3 binary body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WeightsError> {
        if self.pos + n > self.data.len() {
            return Err(WeightsError::Format(format!(
                "premature EOF at byte {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, WeightsError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, WeightsError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_floats(&mut self, count: usize, half: bool) -> Result<Vec<f32>, WeightsError> {
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = self.pos;
            let value = if half {
                let b = self.take(2)?;
                half_to_f32(u16::from_le_bytes([b[0], b[1]]))
            } else {
                let b = self.take(4)?;
                f32::from_le_bytes([b[0], b[1], b[2], b[3]])
            };
            if !value.is_finite() {
                return Err(WeightsError::NonFinite(offset));
            }
            weights.push(value);
        }
        Ok(weights)
    }
}

impl WeightFile {
    fn empty(channels: usize, residual_blocks: usize, value_head_not_stm: bool) -> WeightFile {
        WeightFile {
            channels,
            residual_blocks,
            value_head_not_stm,
            conv_weights: Vec::new(),
            conv_biases: Vec::new(),
            batchnorm_means: Vec::new(),
            batchnorm_stddevs: Vec::new(),
            conv_pol_w: Vec::new(),
            conv_pol_b: Vec::new(),
            bn_pol_w1: Vec::new(),
            bn_pol_w2: Vec::new(),
            ip_pol_w: Vec::new(),
            ip_pol_b: Vec::new(),
            conv_val_w: Vec::new(),
            conv_val_b: Vec::new(),
            bn_val_w1: Vec::new(),
            bn_val_w2: Vec::new(),
            ip1_val_w: Vec::new(),
            ip1_val_b: Vec::new(),
            ip2_val_w: Vec::new(),
            ip2_val_b: Vec::new(),
        }
    }

    /// Load a weights file, dispatching on its format version.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<WeightFile, WeightsError> {
        let raw = std::fs::read(path.as_ref())?;
        let data = maybe_gunzip(raw)?;

        // The first line starts with the version number; for v3 it is the
        // leading '3' of the magic bytes.
        let first_line_end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| WeightsError::Format("missing version line".into()))?;
        let version_digits: String = data[..first_line_end]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        let version: u32 = version_digits
            .parse()
            .map_err(|_| WeightsError::WrongVersion)?;

        let result = match version {
            1 => Self::load_text(&data, false),
            2 => Self::load_text(&data, true),
            3 => Self::load_v3(&data),
            _ => Err(WeightsError::WrongVersion),
        }?;

        info!(
            channels = result.channels,
            blocks = result.residual_blocks,
            version,
            "loaded network weights"
        );
        Ok(result)
    }

    /// v1/v2 text format: one whitespace-separated line per weight tensor.
    fn load_text(data: &[u8], value_head_not_stm: bool) -> Result<WeightFile, WeightsError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| WeightsError::Format("text weights are not valid UTF-8".into()))?;
        let lines: Vec<&str> = text.lines().collect();

        // 1 format id, 1 input layer (4 weight lines), 14 ending weights,
        // the rest are residuals with 8 weight lines each.
        if lines.len() < 1 + 4 + 14 {
            return Err(WeightsError::Format(
                "too few lines for a complete network".into(),
            ));
        }
        let residual_lines = lines.len() - (1 + 4 + 14);
        if residual_lines % 8 != 0 {
            return Err(WeightsError::Format(
                "inconsistent number of weight lines".into(),
            ));
        }
        let residual_blocks = residual_lines / 8;

        // The input convolution biases tell us the tower width.
        let channels = lines[2].split_whitespace().count();

        let plain_conv_layers = 1 + residual_blocks * 2;
        let plain_conv_wts = plain_conv_layers * 4;

        let mut wf = WeightFile::empty(channels, residual_blocks, value_head_not_stm);

        for (linecount, line) in lines[1..].iter().enumerate() {
            let mut weights = Vec::new();
            for token in line.split_whitespace() {
                let value: f32 = token.parse().map_err(|_| {
                    // +1 for the version line, +1 for 0-indexing
                    WeightsError::Format(format!("bad weight on line {}", linecount + 2))
                })?;
                if !value.is_finite() {
                    return Err(WeightsError::NonFinite(linecount + 2));
                }
                weights.push(value);
            }

            if linecount < plain_conv_wts {
                match linecount % 4 {
                    0 => wf.conv_weights.push(weights),
                    1 => wf.conv_biases.push(weights),
                    2 => wf.batchnorm_means.push(weights),
                    _ => {
                        process_bn_var(&mut weights);
                        wf.batchnorm_stddevs.push(weights);
                    }
                }
            } else {
                match linecount - plain_conv_wts {
                    0 => wf.conv_pol_w = weights,
                    1 => wf.conv_pol_b = weights,
                    2 => wf.bn_pol_w1 = weights,
                    3 => wf.bn_pol_w2 = weights,
                    4 => wf.ip_pol_w = weights,
                    5 => wf.ip_pol_b = weights,
                    6 => wf.conv_val_w = weights,
                    7 => wf.conv_val_b = weights,
                    8 => wf.bn_val_w1 = weights,
                    9 => wf.bn_val_w2 = weights,
                    10 => wf.ip1_val_w = weights,
                    11 => wf.ip1_val_b = weights,
                    12 => wf.ip2_val_w = weights,
                    13 => wf.ip2_val_b = weights,
                    _ => unreachable!("line counting is off"),
                }
            }
        }

        process_bn_var(&mut wf.bn_pol_w2);
        process_bn_var(&mut wf.bn_val_w2);

        wf.validate()?;
        Ok(wf)
    }

    /// v3 binary format.
    fn load_v3(data: &[u8]) -> Result<WeightFile, WeightsError> {
        let mut r = Reader { data, pos: 0 };

        let magic = r.take(5)?;
        if magic != b"3LZW\n" {
            return Err(WeightsError::Format(
                "failed magic bytes check; is this a weights file?".into(),
            ));
        }

        let value_head_type = r.read_u8()?;
        if value_head_type > 1 {
            return Err(WeightsError::Format(
                "value head type is out of range".into(),
            ));
        }

        let float_size = r.read_u8()?;
        if float_size > 1 {
            return Err(WeightsError::Format("float size byte is out of range".into()));
        }
        let half = float_size == 0;

        let blocks = r.read_u16_le()? as usize;
        if blocks == 0 {
            return Err(WeightsError::Format("detected zero blocks".into()));
        }
        let filters = r.read_u16_le()? as usize;
        if filters == 0 {
            return Err(WeightsError::Format("detected zero filters".into()));
        }

        let mut wf = WeightFile::empty(filters, blocks, value_head_type != 0);

        for block in 0..1 + 2 * blocks {
            // The input layer has a different shape: it reads the full
            // input plane stack.
            let count = if block == 0 {
                filters * INPUT_LAYER_WEIGHTS_PER_FILTER
            } else {
                filters * filters * 9
            };
            wf.conv_weights.push(r.read_floats(count, half)?);
            wf.conv_biases.push(r.read_floats(filters, half)?);
            wf.batchnorm_means.push(r.read_floats(filters, half)?);
            let mut stddevs = r.read_floats(filters, half)?;
            process_bn_var(&mut stddevs);
            wf.batchnorm_stddevs.push(stddevs);
        }

        // And the final fourteen tensors
        wf.conv_pol_w = r.read_floats(OUTPUTS_POLICY * filters, half)?;
        wf.conv_pol_b = r.read_floats(OUTPUTS_POLICY, half)?;
        wf.bn_pol_w1 = r.read_floats(OUTPUTS_POLICY, half)?;
        wf.bn_pol_w2 = r.read_floats(OUTPUTS_POLICY, half)?;
        wf.ip_pol_w = r.read_floats(
            OUTPUTS_POLICY * NUM_INTERSECTIONS * (NUM_INTERSECTIONS + 1),
            half,
        )?;
        wf.ip_pol_b = r.read_floats(NUM_INTERSECTIONS + 1, half)?;

        wf.conv_val_w = r.read_floats(OUTPUTS_VALUE * filters, half)?;
        wf.conv_val_b = r.read_floats(OUTPUTS_VALUE, half)?;
        wf.bn_val_w1 = r.read_floats(OUTPUTS_VALUE, half)?;
        wf.bn_val_w2 = r.read_floats(OUTPUTS_VALUE, half)?;
        wf.ip1_val_w = r.read_floats(NUM_INTERSECTIONS * VALUE_HIDDEN, half)?;
        wf.ip1_val_b = r.read_floats(VALUE_HIDDEN, half)?;
        wf.ip2_val_w = r.read_floats(VALUE_HIDDEN, half)?;
        wf.ip2_val_b = r.read_floats(OUTPUTS_VALUE, half)?;

        process_bn_var(&mut wf.bn_pol_w2);
        process_bn_var(&mut wf.bn_val_w2);

        if r.pos != data.len() {
            warn!(
                position = r.pos,
                end = data.len(),
                "leftover data in weights file"
            );
        }

        wf.validate()?;
        Ok(wf)
    }

    /// Verify every tensor has the dimensions the forward path expects.
    fn validate(&self) -> Result<(), WeightsError> {
        let c = self.channels;
        let layers = 1 + 2 * self.residual_blocks;

        let check = |name: &str, actual: usize, expected: usize| {
            if actual != expected {
                Err(WeightsError::Format(format!(
                    "{} has {} weights, expected {}",
                    name, actual, expected
                )))
            } else {
                Ok(())
            }
        };

        check("convolution list", self.conv_weights.len(), layers)?;
        check("bias list", self.conv_biases.len(), layers)?;
        check("batchnorm mean list", self.batchnorm_means.len(), layers)?;
        check(
            "batchnorm stddev list",
            self.batchnorm_stddevs.len(),
            layers,
        )?;

        for (i, w) in self.conv_weights.iter().enumerate() {
            let expected = if i == 0 {
                c * INPUT_LAYER_WEIGHTS_PER_FILTER
            } else {
                c * c * 9
            };
            check("convolution weights", w.len(), expected)?;
        }
        for list in [
            &self.conv_biases,
            &self.batchnorm_means,
            &self.batchnorm_stddevs,
        ] {
            for w in list.iter() {
                check("per-channel tensor", w.len(), c)?;
            }
        }

        check("policy conv weights", self.conv_pol_w.len(), OUTPUTS_POLICY * c)?;
        check("policy conv biases", self.conv_pol_b.len(), OUTPUTS_POLICY)?;
        check("policy bn means", self.bn_pol_w1.len(), OUTPUTS_POLICY)?;
        check("policy bn stddevs", self.bn_pol_w2.len(), OUTPUTS_POLICY)?;
        check(
            "policy ip weights",
            self.ip_pol_w.len(),
            OUTPUTS_POLICY * NUM_INTERSECTIONS * (NUM_INTERSECTIONS + 1),
        )?;
        check("policy ip biases", self.ip_pol_b.len(), NUM_INTERSECTIONS + 1)?;

        check("value conv weights", self.conv_val_w.len(), OUTPUTS_VALUE * c)?;
        check("value conv biases", self.conv_val_b.len(), OUTPUTS_VALUE)?;
        check("value bn means", self.bn_val_w1.len(), OUTPUTS_VALUE)?;
        check("value bn stddevs", self.bn_val_w2.len(), OUTPUTS_VALUE)?;
        check(
            "value ip1 weights",
            self.ip1_val_w.len(),
            NUM_INTERSECTIONS * VALUE_HIDDEN,
        )?;
        check("value ip1 biases", self.ip1_val_b.len(), VALUE_HIDDEN)?;
        check("value ip2 weights", self.ip2_val_w.len(), VALUE_HIDDEN)?;
        check("value ip2 biases", self.ip2_val_b.len(), OUTPUTS_VALUE)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn push_floats(out: &mut Vec<u8>, count: usize, value: f32) {
        for _ in 0..count {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Serialize a tiny v3 network with the given tower width.
    fn v3_bytes(filters: usize, blocks: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"3LZW\n");
        out.push(0); // v1-style value head
        out.push(1); // 32-bit floats
        out.extend_from_slice(&(blocks as u16).to_le_bytes());
        out.extend_from_slice(&(filters as u16).to_le_bytes());

        for block in 0..1 + 2 * blocks {
            let count = if block == 0 {
                filters * INPUT_LAYER_WEIGHTS_PER_FILTER
            } else {
                filters * filters * 9
            };
            push_floats(&mut out, count, 0.1);
            push_floats(&mut out, filters, 0.0); // biases
            push_floats(&mut out, filters, 0.0); // bn means
            push_floats(&mut out, filters, 1.0); // bn variances
        }

        push_floats(&mut out, OUTPUTS_POLICY * filters, 0.1);
        push_floats(&mut out, OUTPUTS_POLICY, 0.0);
        push_floats(&mut out, OUTPUTS_POLICY, 0.0);
        push_floats(&mut out, OUTPUTS_POLICY, 1.0);
        push_floats(
            &mut out,
            OUTPUTS_POLICY * NUM_INTERSECTIONS * (NUM_INTERSECTIONS + 1),
            0.01,
        );
        push_floats(&mut out, NUM_INTERSECTIONS + 1, 0.0);

        push_floats(&mut out, filters, 0.1);
        push_floats(&mut out, OUTPUTS_VALUE, 0.0);
        push_floats(&mut out, OUTPUTS_VALUE, 0.0);
        push_floats(&mut out, OUTPUTS_VALUE, 1.0);
        push_floats(&mut out, NUM_INTERSECTIONS * VALUE_HIDDEN, 0.01);
        push_floats(&mut out, VALUE_HIDDEN, 0.0);
        push_floats(&mut out, VALUE_HIDDEN, 0.01);
        push_floats(&mut out, OUTPUTS_VALUE, 0.0);

        out
    }

    fn write_temp(name: &str, data: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("goban-weights-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_v3_roundtrip() {
        let path = write_temp("net-v3.bin", &v3_bytes(2, 1));
        let wf = WeightFile::load(&path).unwrap();
        assert_eq!(wf.channels, 2);
        assert_eq!(wf.residual_blocks, 1);
        assert!(!wf.value_head_not_stm);
        assert_eq!(wf.conv_weights.len(), 3);
        // Variances were converted to reciprocal standard deviations
        assert!((wf.batchnorm_stddevs[0][0] - 1.0 / (1.0f32 + 1e-5).sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_v3_gzip_wrapped() {
        let raw = v3_bytes(2, 1);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw).unwrap();
        let path = write_temp("net-v3.bin.gz", &encoder.finish().unwrap());

        let wf = WeightFile::load(&path).unwrap();
        assert_eq!(wf.channels, 2);
    }

    #[test]
    fn test_v3_rejects_non_finite() {
        let mut raw = v3_bytes(2, 1);
        // Clobber one of the tower weights with NaN
        let offset = 11;
        raw[offset..offset + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        let path = write_temp("net-nan.bin", &raw);
        assert!(matches!(
            WeightFile::load(&path),
            Err(WeightsError::NonFinite(_))
        ));
    }

    #[test]
    fn test_v3_rejects_truncation() {
        let raw = v3_bytes(2, 1);
        let path = write_temp("net-short.bin", &raw[..raw.len() / 2]);
        assert!(matches!(
            WeightFile::load(&path),
            Err(WeightsError::Format(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let path = write_temp("net-v9.txt", b"9\n0.1 0.2\n");
        assert!(matches!(
            WeightFile::load(&path),
            Err(WeightsError::WrongVersion)
        ));
    }

    fn text_line(count: usize, value: f32) -> String {
        let mut s = String::new();
        for i in 0..count {
            if i > 0 {
                s.push(' ');
            }
            s.push_str(&format!("{}", value));
        }
        s.push('\n');
        s
    }

    fn v1_text(version: u32, filters: usize, blocks: usize) -> String {
        let mut out = format!("{}\n", version);
        for block in 0..1 + 2 * blocks {
            let count = if block == 0 {
                filters * INPUT_LAYER_WEIGHTS_PER_FILTER
            } else {
                filters * filters * 9
            };
            out.push_str(&text_line(count, 0.1));
            out.push_str(&text_line(filters, 0.0));
            out.push_str(&text_line(filters, 0.0));
            out.push_str(&text_line(filters, 1.0));
        }
        out.push_str(&text_line(OUTPUTS_POLICY * filters, 0.1));
        out.push_str(&text_line(OUTPUTS_POLICY, 0.0));
        out.push_str(&text_line(OUTPUTS_POLICY, 0.0));
        out.push_str(&text_line(OUTPUTS_POLICY, 1.0));
        out.push_str(&text_line(
            OUTPUTS_POLICY * NUM_INTERSECTIONS * (NUM_INTERSECTIONS + 1),
            0.01,
        ));
        out.push_str(&text_line(NUM_INTERSECTIONS + 1, 0.0));
        out.push_str(&text_line(filters, 0.1));
        out.push_str(&text_line(OUTPUTS_VALUE, 0.0));
        out.push_str(&text_line(OUTPUTS_VALUE, 0.0));
        out.push_str(&text_line(OUTPUTS_VALUE, 1.0));
        out.push_str(&text_line(NUM_INTERSECTIONS * VALUE_HIDDEN, 0.01));
        out.push_str(&text_line(VALUE_HIDDEN, 0.0));
        out.push_str(&text_line(VALUE_HIDDEN, 0.01));
        out.push_str(&text_line(OUTPUTS_VALUE, 0.0));
        out
    }

    #[test]
    fn test_v1_text_parses() {
        let path = write_temp("net-v1.txt", v1_text(1, 2, 1).as_bytes());
        let wf = WeightFile::load(&path).unwrap();
        assert_eq!(wf.channels, 2);
        assert_eq!(wf.residual_blocks, 1);
        assert!(!wf.value_head_not_stm);
    }

    #[test]
    fn test_v2_sets_black_value_convention() {
        let path = write_temp("net-v2.txt", v1_text(2, 2, 1).as_bytes());
        let wf = WeightFile::load(&path).unwrap();
        assert!(wf.value_head_not_stm);
    }

    #[test]
    fn test_v1_rejects_dropped_line() {
        let text = v1_text(1, 2, 1);
        let truncated: String = {
            let mut lines: Vec<&str> = text.lines().collect();
            lines.pop();
            lines.join("\n") + "\n"
        };
        let path = write_temp("net-v1-short.txt", truncated.as_bytes());
        assert!(matches!(
            WeightFile::load(&path),
            Err(WeightsError::Format(_))
        ));
    }

    #[test]
    fn test_half_float_decoding() {
        assert_eq!(half_to_f32(0x3c00), 1.0);
        assert_eq!(half_to_f32(0xbc00), -1.0);
        assert_eq!(half_to_f32(0x0000), 0.0);
        assert!((half_to_f32(0x3555) - 0.333).abs() < 1e-3);
        assert!(half_to_f32(0x7c00).is_infinite());
        assert!(half_to_f32(0x7e00).is_nan());
    }
}
