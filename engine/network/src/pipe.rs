//! The forward-pass contract and the reference implementation.
//!
//! [`ForwardPipe`] is the seam between the evaluator and the convolution
//! kernels: a back-end receives the transformed weights once at startup and
//! then maps input plane tensors to raw policy/value head planes. Back-ends
//! are free to batch concurrent `forward` calls internally; the evaluator
//! treats the call as blocking and thread-safe.
//!
//! [`ReferencePipe`] is the in-crate oracle: it undoes the Winograd filter
//! transform and runs the textbook direct convolution. It exists for tests
//! and for the accelerator self-check, not for speed.

use crate::network::{BOARD_SIZE, NUM_INTERSECTIONS};
use crate::winograd::winograd_untransform_f;

/// A convolution back-end.
///
/// Weights arrive through the `push_*` calls in network order: one input
/// convolution, the residual tower, then the two 1x1 head convolutions.
/// `forward` may be called from many threads at once.
pub trait ForwardPipe: Send + Sync {
    /// Announce the residual tower width before any weights are pushed.
    fn initialize(&mut self, channels: usize);

    /// The input convolution, with Winograd-transformed weights and
    /// batch-norm parameters (biases already folded into the means).
    fn push_input_convolution(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        winograd_u: &[f32],
        bn_means: &[f32],
        bn_stddevs: &[f32],
    );

    /// One residual block: two convolutions with a skip connection.
    #[allow(clippy::too_many_arguments)]
    fn push_residual(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        winograd_u1: &[f32],
        bn_means1: &[f32],
        bn_stddevs1: &[f32],
        winograd_u2: &[f32],
        bn_means2: &[f32],
        bn_stddevs2: &[f32],
    );

    /// A plain 1x1 head convolution (policy or value), untransformed.
    fn push_convolve(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        weights: &[f32],
    );

    /// Run the tower. `input` is INPUT_CHANNELS x 361 planes; the outputs
    /// receive the raw policy (2 x 361) and value (1 x 361) head planes.
    fn forward(&self, input: &[f32], policy_out: &mut [f32], value_out: &mut [f32]);
}

struct ConvLayer {
    in_channels: usize,
    out_channels: usize,
    /// Plain 3x3 filters, recovered from the Winograd tensor.
    filters: Vec<f32>,
    bn_means: Vec<f32>,
    bn_stddevs: Vec<f32>,
}

struct ResidualLayer {
    first: ConvLayer,
    second: ConvLayer,
}

struct HeadLayer {
    in_channels: usize,
    out_channels: usize,
    weights: Vec<f32>,
}

/// Scalar direct-convolution back-end used as the correctness oracle.
#[derive(Default)]
pub struct ReferencePipe {
    channels: usize,
    input_conv: Option<ConvLayer>,
    residuals: Vec<ResidualLayer>,
    heads: Vec<HeadLayer>,
}

impl ReferencePipe {
    pub fn new() -> ReferencePipe {
        ReferencePipe::default()
    }

    /// 3x3 convolution with zero padding, direct evaluation.
    fn convolve3(layer: &ConvLayer, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), layer.in_channels * NUM_INTERSECTIONS);
        debug_assert_eq!(output.len(), layer.out_channels * NUM_INTERSECTIONS);
        let size = BOARD_SIZE as i32;

        for o in 0..layer.out_channels {
            let out_plane = &mut output[o * NUM_INTERSECTIONS..(o + 1) * NUM_INTERSECTIONS];
            out_plane.fill(0.0);
            for c in 0..layer.in_channels {
                let in_plane = &input[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS];
                let filter = &layer.filters[(o * layer.in_channels + c) * 9..][..9];
                for y in 0..size {
                    for x in 0..size {
                        let mut acc = 0.0f32;
                        for dy in -1..=1i32 {
                            let sy = y + dy;
                            if sy < 0 || sy >= size {
                                continue;
                            }
                            for dx in -1..=1i32 {
                                let sx = x + dx;
                                if sx < 0 || sx >= size {
                                    continue;
                                }
                                acc += in_plane[(sy * size + sx) as usize]
                                    * filter[((dy + 1) * 3 + (dx + 1)) as usize];
                            }
                        }
                        out_plane[(y * size + x) as usize] += acc;
                    }
                }
            }
        }
    }

    /// Batch normalization, optional residual add, ReLU.
    fn batchnorm(layer: &ConvLayer, data: &mut [f32], residual: Option<&[f32]>) {
        for c in 0..layer.out_channels {
            let mean = layer.bn_means[c];
            let stddev = layer.bn_stddevs[c];
            let plane = &mut data[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS];
            match residual {
                None => {
                    for v in plane.iter_mut() {
                        *v = (stddev * (*v - mean)).max(0.0);
                    }
                }
                Some(res) => {
                    let res_plane = &res[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS];
                    for (v, r) in plane.iter_mut().zip(res_plane) {
                        *v = (stddev * (*v - mean) + r).max(0.0);
                    }
                }
            }
        }
    }

    fn convolve1(head: &HeadLayer, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(output.len(), head.out_channels * NUM_INTERSECTIONS);
        for o in 0..head.out_channels {
            let out_plane = &mut output[o * NUM_INTERSECTIONS..(o + 1) * NUM_INTERSECTIONS];
            out_plane.fill(0.0);
            for c in 0..head.in_channels {
                let w = head.weights[o * head.in_channels + c];
                let in_plane = &input[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS];
                for (out, inp) in out_plane.iter_mut().zip(in_plane) {
                    *out += w * inp;
                }
            }
        }
    }
}

impl ForwardPipe for ReferencePipe {
    fn initialize(&mut self, channels: usize) {
        self.channels = channels;
        self.input_conv = None;
        self.residuals.clear();
        self.heads.clear();
    }

    fn push_input_convolution(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        winograd_u: &[f32],
        bn_means: &[f32],
        bn_stddevs: &[f32],
    ) {
        debug_assert_eq!(filter_size, crate::winograd::WINOGRAD_ALPHA);
        self.input_conv = Some(ConvLayer {
            in_channels,
            out_channels,
            filters: winograd_untransform_f(winograd_u, out_channels, in_channels),
            bn_means: bn_means.to_vec(),
            bn_stddevs: bn_stddevs.to_vec(),
        });
    }

    fn push_residual(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        winograd_u1: &[f32],
        bn_means1: &[f32],
        bn_stddevs1: &[f32],
        winograd_u2: &[f32],
        bn_means2: &[f32],
        bn_stddevs2: &[f32],
    ) {
        debug_assert_eq!(filter_size, crate::winograd::WINOGRAD_ALPHA);
        self.residuals.push(ResidualLayer {
            first: ConvLayer {
                in_channels,
                out_channels,
                filters: winograd_untransform_f(winograd_u1, out_channels, in_channels),
                bn_means: bn_means1.to_vec(),
                bn_stddevs: bn_stddevs1.to_vec(),
            },
            second: ConvLayer {
                in_channels,
                out_channels,
                filters: winograd_untransform_f(winograd_u2, out_channels, in_channels),
                bn_means: bn_means2.to_vec(),
                bn_stddevs: bn_stddevs2.to_vec(),
            },
        });
    }

    fn push_convolve(
        &mut self,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        weights: &[f32],
    ) {
        debug_assert_eq!(filter_size, 1);
        self.heads.push(HeadLayer {
            in_channels,
            out_channels,
            weights: weights.to_vec(),
        });
    }

    fn forward(&self, input: &[f32], policy_out: &mut [f32], value_out: &mut [f32]) {
        let input_conv = self
            .input_conv
            .as_ref()
            .expect("forward called before weights were pushed");
        debug_assert_eq!(self.heads.len(), 2, "expected policy and value heads");

        let mut x = vec![0.0f32; self.channels * NUM_INTERSECTIONS];
        Self::convolve3(input_conv, input, &mut x);
        Self::batchnorm(input_conv, &mut x, None);

        let mut y = vec![0.0f32; self.channels * NUM_INTERSECTIONS];
        let mut z = vec![0.0f32; self.channels * NUM_INTERSECTIONS];
        for block in &self.residuals {
            Self::convolve3(&block.first, &x, &mut y);
            Self::batchnorm(&block.first, &mut y, None);
            Self::convolve3(&block.second, &y, &mut z);
            Self::batchnorm(&block.second, &mut z, Some(&x));
            std::mem::swap(&mut x, &mut z);
        }

        Self::convolve1(&self.heads[0], &x, policy_out);
        Self::convolve1(&self.heads[1], &x, value_out);
    }
}
