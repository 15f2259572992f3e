//! The underwater light-transport medium.
//!
//! `out = J * exp(-σ_att * d) + B * (1 - exp(-σ_bs * d))`, per channel.

pub use crate::{
    error::Error,
    function::{logit, sigmoid, softplus, softplus_grad, softplus_inverse, Image, ScalarMap},
};
pub use burn::{config::Config, record::Record};

use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};

#[derive(Config, Copy, Debug, PartialEq)]
pub struct MediumConfig {
    /// The initial attenuation coefficients, activated.
    #[config(default = "[0.8, 0.8, 0.8]")]
    pub attenuation: [f32; 3],

    /// The initial backscatter coefficients, activated.
    #[config(default = "[0.8, 0.8, 0.8]")]
    pub backscatter: [f32; 3],

    /// The initial backscatter colour, activated.
    #[config(default = "[0.05, 0.2, 0.3]")]
    pub backscatter_color: [f32; 3],

    /// Whether to show the backscatter colour through empty pixels.
    #[config(default = "true")]
    pub background: bool,

    /// A bias added to the raw coefficients before the softplus.
    #[config(default = "0.0")]
    pub density_bias: f32,

    /// Disabling the medium entirely.
    #[config(default = "false")]
    pub zero_medium: bool,
}

/// Raw per-channel medium parameters, or their gradients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Record)]
pub struct MediumParameters {
    pub attenuation: [f32; 3],
    pub backscatter: [f32; 3],
    pub backscatter_color: [f32; 3],
}

/// Activated per-channel medium coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MediumCoefficients {
    /// `σ_att >= 0`
    pub attenuation: [f32; 3],
    /// `σ_bs >= 0`
    pub backscatter: [f32; 3],
    /// `B` in `(0, 1)`
    pub backscatter_color: [f32; 3],
}

#[derive(Clone, Debug, PartialEq)]
pub struct Medium {
    pub config: MediumConfig,
    pub parameters: MediumParameters,
}

/// The gradients of a composite w.r.t. its inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct MediumBackward {
    pub coefficients: MediumCoefficients,
    pub direct: Image,
    pub depth: ScalarMap,
    pub transmittance: ScalarMap,
}

impl MediumConfig {
    pub fn init(&self) -> Medium {
        Medium {
            config: *self,
            parameters: MediumParameters {
                attenuation: self
                    .attenuation
                    .map(|v| softplus_inverse(v) - self.density_bias),
                backscatter: self
                    .backscatter
                    .map(|v| softplus_inverse(v) - self.density_bias),
                backscatter_color: self.backscatter_color.map(logit),
            },
        }
    }
}

impl Medium {
    /// The activated coefficients, all zero if the medium is disabled.
    pub fn coefficients(&self) -> MediumCoefficients {
        if self.config.zero_medium {
            return MediumCoefficients::default();
        }

        let bias = self.config.density_bias;
        MediumCoefficients {
            attenuation: self.parameters.attenuation.map(|v| softplus(v + bias)),
            backscatter: self.parameters.backscatter.map(|v| softplus(v + bias)),
            backscatter_color: self.parameters.backscatter_color.map(sigmoid),
        }
    }

    /// Compositing with or without the background term per [`MediumConfig::background`].
    pub fn composite(
        &self,
        direct: &Image,
        depth: &ScalarMap,
        transmittance: &ScalarMap,
    ) -> Image {
        let coefficients = self.coefficients();
        if self.config.background {
            coefficients.apply_with_background(direct, depth, transmittance)
        } else {
            coefficients.apply(direct, depth)
        }
    }

    /// Back-propagating through [`Self::composite`].
    ///
    /// The gradient of the coefficients is chained into the raw parameters.
    pub fn backward(
        &self,
        direct: &Image,
        depth: &ScalarMap,
        transmittance: &ScalarMap,
        grad_output: &Image,
    ) -> (MediumBackward, MediumParameters) {
        let coefficients = self.coefficients();
        let output = coefficients.backward(
            direct,
            depth,
            self.config.background.then_some(transmittance),
            grad_output,
        );
        let grads = self.backward_parameters(&output.coefficients);
        (output, grads)
    }

    /// Chaining the coefficient gradients through the activations.
    pub fn backward_parameters(
        &self,
        grads: &MediumCoefficients,
    ) -> MediumParameters {
        if self.config.zero_medium {
            return MediumParameters::default();
        }

        let bias = self.config.density_bias;
        let chain = |raw: [f32; 3], grad: [f32; 3]| {
            [0, 1, 2].map(|c| grad[c] * softplus_grad(raw[c] + bias))
        };
        MediumParameters {
            attenuation: chain(self.parameters.attenuation, grads.attenuation),
            backscatter: chain(self.parameters.backscatter, grads.backscatter),
            backscatter_color: [0, 1, 2].map(|c| {
                let b = sigmoid(self.parameters.backscatter_color[c]);
                grads.backscatter_color[c] * b * (1.0 - b)
            }),
        }
    }
}

impl MediumCoefficients {
    /// The composite of one channel.
    #[inline]
    pub fn composite_channel(
        &self,
        channel: usize,
        direct: f32,
        depth: f32,
    ) -> f32 {
        let attenuation = (-self.attenuation[channel] * depth).exp();
        let backscatter = (-self.backscatter[channel] * depth).exp();
        direct * attenuation + self.backscatter_color[channel] * (1.0 - backscatter)
    }

    /// `J * exp(-σ_att * d) + B * (1 - exp(-σ_bs * d))`
    pub fn apply(
        &self,
        direct: &Image,
        depth: &ScalarMap,
    ) -> Image {
        let mut output = Image::new(direct.width, direct.height);
        output
            .pixels
            .par_iter_mut()
            .zip(direct.pixels.par_iter())
            .zip(depth.values.par_iter())
            .for_each(|((out, j), d)| {
                *out = [0, 1, 2].map(|c| self.composite_channel(c, j[c], *d));
            });
        output
    }

    /// [`Self::apply`] plus `B * T_final`, the open water behind all splats.
    pub fn apply_with_background(
        &self,
        direct: &Image,
        depth: &ScalarMap,
        transmittance: &ScalarMap,
    ) -> Image {
        let mut output = self.apply(direct, depth);
        output
            .pixels
            .par_iter_mut()
            .zip(transmittance.values.par_iter())
            .for_each(|(out, t)| {
                (0..3).for_each(|c| out[c] += self.backscatter_color[c] * t);
            });
        output
    }

    /// The exact partial derivatives of the composite.
    ///
    /// The background term `B * T_final` is included if `transmittance` is given.
    pub fn backward(
        &self,
        direct: &Image,
        depth: &ScalarMap,
        transmittance: Option<&ScalarMap>,
        grad_output: &Image,
    ) -> MediumBackward {
        let (width, height) = (direct.width, direct.height);
        let mut grad_direct = Image::new(width, height);
        let mut grad_depth = ScalarMap::new(width, height);
        let mut grad_transmittance = ScalarMap::new(width, height);

        let coefficients = grad_direct
            .pixels
            .par_iter_mut()
            .zip(grad_depth.values.par_iter_mut())
            .zip(grad_transmittance.values.par_iter_mut())
            .enumerate()
            .fold(MediumCoefficients::default, |mut sum, (index, ((g_j, g_d), g_t))| {
                let j = direct.pixels[index];
                let d = depth.values[index];
                let t = transmittance.map(|t| t.values[index]);
                let g = grad_output.pixels[index];

                (0..3).for_each(|c| {
                    let e_a = (-self.attenuation[c] * d).exp();
                    let e_b = (-self.backscatter[c] * d).exp();
                    let b = self.backscatter_color[c];

                    g_j[c] = g[c] * e_a;
                    *g_d += g[c] * (-self.attenuation[c] * j[c] * e_a + b * self.backscatter[c] * e_b);
                    sum.attenuation[c] += g[c] * (-d * j[c] * e_a);
                    sum.backscatter[c] += g[c] * (b * d * e_b);
                    sum.backscatter_color[c] += g[c] * (1.0 - e_b + t.unwrap_or(0.0));
                    if t.is_some() {
                        *g_t += g[c] * b;
                    }
                });
                sum
            })
            .reduce(MediumCoefficients::default, |a, b| a.sum_with(&b));

        MediumBackward {
            coefficients,
            direct: grad_direct,
            depth: grad_depth,
            transmittance: grad_transmittance,
        }
    }

    #[inline]
    fn sum_with(
        &self,
        other: &Self,
    ) -> Self {
        let sum = |a: [f32; 3], b: [f32; 3]| [a[0] + b[0], a[1] + b[1], a[2] + b[2]];
        Self {
            attenuation: sum(self.attenuation, other.attenuation),
            backscatter: sum(self.backscatter, other.backscatter),
            backscatter_color: sum(self.backscatter_color, other.backscatter_color),
        }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.attenuation
            .iter()
            .chain(&self.backscatter)
            .chain(&self.backscatter_color)
            .all(|v| v.is_finite())
    }
}

impl MediumParameters {
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.attenuation
            .iter()
            .chain(&self.backscatter)
            .chain(&self.backscatter_color)
            .all(|v| v.is_finite())
    }
}

impl Default for Medium {
    #[inline]
    fn default() -> Self {
        MediumConfig::default().init()
    }
}

impl Default for MediumConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(
        width: u32,
        height: u32,
    ) -> Image {
        let mut image = Image::new(width, height);
        image.pixels.iter_mut().enumerate().for_each(|(i, p)| {
            *p = [0.1 + 0.05 * i as f32, 0.9 - 0.07 * i as f32, 0.4];
        });
        image
    }

    fn depth_map(
        width: u32,
        height: u32,
    ) -> ScalarMap {
        let mut depth = ScalarMap::new(width, height);
        depth
            .values
            .iter_mut()
            .enumerate()
            .for_each(|(i, d)| *d = 0.3 * i as f32);
        depth
    }

    #[test]
    fn depth_zero_is_identity() {
        let direct = gradient_image(3, 2);
        let depth = ScalarMap::new(3, 2);
        let coefficients = Medium::default().coefficients();

        let output = coefficients.apply(&direct, &depth);
        assert_eq!(output, direct);
    }

    #[test]
    fn vanishing_coefficients_converge_to_direct() {
        let direct = gradient_image(3, 2);
        let depth = depth_map(3, 2);

        let errors = [1.0, 1e-2, 1e-4].map(|scale| {
            let coefficients = MediumCoefficients {
                attenuation: [scale; 3],
                backscatter: [scale; 3],
                backscatter_color: [0.5; 3],
            };
            let output = coefficients.apply(&direct, &depth);
            assert!(output.is_finite());
            output
                .pixels
                .iter()
                .flatten()
                .zip(direct.pixels.iter().flatten())
                .map(|(o, t)| (o - t).abs())
                .fold(0.0, f32::max)
        });
        assert!(errors[0] > errors[1] && errors[1] > errors[2], "{errors:?}");
        assert!(errors[2] < 1e-3, "{errors:?}");

        let zero = MediumCoefficients::default().apply(&direct, &depth);
        assert_eq!(zero, direct);
    }

    #[test]
    fn large_depth_is_finite() {
        let direct = gradient_image(2, 2);
        let mut depth = ScalarMap::filled(2, 2, 1e30);
        depth.values[0] = 0.0;
        let coefficients = Medium::default().coefficients();

        let output = coefficients.apply(&direct, &depth);
        assert!(output.is_finite());
        assert_eq!(output.pixels[0], direct.pixels[0]);
        let target = coefficients.backscatter_color;
        output.pixels[1]
            .iter()
            .zip(target)
            .for_each(|(o, t)| assert!((o - t).abs() < 1e-6));
    }

    #[test]
    fn background_adds_backscatter_color() {
        let direct = Image::new(1, 1);
        let depth = ScalarMap::new(1, 1);
        let transmittance = ScalarMap::filled(1, 1, 1.0);
        let medium = Medium::default();

        let output = medium.composite(&direct, &depth, &transmittance);
        let target = medium.coefficients().backscatter_color;
        output.pixels[0]
            .iter()
            .zip(target)
            .for_each(|(o, t)| assert!((o - t).abs() < 1e-6));

        let medium = Medium {
            config: MediumConfig::default().with_zero_medium(true),
            ..Default::default()
        };
        let output = medium.composite(&direct, &depth, &transmittance);
        assert_eq!(output, direct);
    }

    #[test]
    fn coefficients_are_non_negative() {
        let medium = Medium {
            parameters: MediumParameters {
                attenuation: [-100.0, 0.0, 100.0],
                backscatter: [-1e4, -3.0, 3.0],
                backscatter_color: [-50.0, 0.0, 50.0],
            },
            ..Default::default()
        };
        let coefficients = medium.coefficients();
        assert!(coefficients.is_finite());
        coefficients
            .attenuation
            .iter()
            .chain(&coefficients.backscatter)
            .for_each(|v| assert!(*v >= 0.0, "{v}"));
        coefficients
            .backscatter_color
            .iter()
            .for_each(|v| assert!((0.0..=1.0).contains(v), "{v}"));
    }

    #[test]
    fn config_init_matches_activated_values() {
        let config = MediumConfig::default().with_density_bias(0.5);
        let coefficients = config.init().coefficients();

        [
            (coefficients.attenuation, config.attenuation),
            (coefficients.backscatter, config.backscatter),
            (coefficients.backscatter_color, config.backscatter_color),
        ]
        .into_iter()
        .for_each(|(output, target)| {
            output
                .iter()
                .zip(target)
                .for_each(|(o, t)| assert!((o - t).abs() < 1e-5, "{o} != {t}"));
        });
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (width, height) = (3, 2);
        let direct = gradient_image(width, height);
        let depth = depth_map(width, height);
        let mut transmittance = ScalarMap::new(width, height);
        transmittance
            .values
            .iter_mut()
            .enumerate()
            .for_each(|(i, t)| *t = 0.1 * i as f32);
        let mut grad_output = Image::new(width, height);
        grad_output.pixels.iter_mut().enumerate().for_each(|(i, g)| {
            *g = [1.0, -0.5 + 0.1 * i as f32, 0.25];
        });

        let medium = Medium {
            config: MediumConfig::default().with_density_bias(0.2),
            parameters: MediumParameters {
                attenuation: [0.3, -0.2, 0.1],
                backscatter: [-0.4, 0.5, 0.0],
                backscatter_color: [-1.0, 0.2, 0.7],
            },
        };
        let loss = |medium: &Medium, direct: &Image, depth: &ScalarMap, transmittance: &ScalarMap| {
            let output = medium.composite(direct, depth, transmittance);
            output
                .pixels
                .iter()
                .zip(&grad_output.pixels)
                .map(|(o, g)| (0..3).map(|c| o[c] as f64 * g[c] as f64).sum::<f64>())
                .sum::<f64>()
        };
        let (output, grads) = medium.backward(&direct, &depth, &transmittance, &grad_output);

        let epsilon = 1e-3;
        let assert_close = |name: &str, analytic: f32, numeric: f64| {
            let error = (analytic as f64 - numeric).abs();
            assert!(error < 2e-3 * (1.0 + numeric.abs()), "{name}: {analytic} != {numeric}");
        };

        (0..3).for_each(|c| {
            let analytic = [grads.attenuation[c], grads.backscatter[c], grads.backscatter_color[c]];
            analytic.into_iter().enumerate().for_each(|(group, analytic)| {
                let perturb = |delta: f32| {
                    let mut medium = medium.to_owned();
                    let parameters = &mut medium.parameters;
                    match group {
                        0 => parameters.attenuation[c] += delta,
                        1 => parameters.backscatter[c] += delta,
                        _ => parameters.backscatter_color[c] += delta,
                    }
                    medium
                };
                let numeric = (loss(&perturb(epsilon), &direct, &depth, &transmittance)
                    - loss(&perturb(-epsilon), &direct, &depth, &transmittance))
                    / (2.0 * epsilon as f64);
                assert_close("parameters", analytic, numeric);
            });
        });

        let index = 4;
        let mut plus = depth.to_owned();
        plus.values[index] += epsilon;
        let mut minus = depth.to_owned();
        minus.values[index] -= epsilon;
        let numeric = (loss(&medium, &direct, &plus, &transmittance)
            - loss(&medium, &direct, &minus, &transmittance))
            / (2.0 * epsilon as f64);
        assert_close("depth", output.depth.values[index], numeric);

        let mut plus = transmittance.to_owned();
        plus.values[index] += epsilon;
        let mut minus = transmittance.to_owned();
        minus.values[index] -= epsilon;
        let numeric = (loss(&medium, &direct, &depth, &plus)
            - loss(&medium, &direct, &depth, &minus))
            / (2.0 * epsilon as f64);
        assert_close("transmittance", output.transmittance.values[index], numeric);

        (0..3).for_each(|c| {
            let mut plus = direct.to_owned();
            plus.pixels[index][c] += epsilon;
            let mut minus = direct.to_owned();
            minus.pixels[index][c] -= epsilon;
            let numeric = (loss(&medium, &plus, &depth, &transmittance)
                - loss(&medium, &minus, &depth, &transmittance))
                / (2.0 * epsilon as f64);
            assert_close("direct", output.direct.pixels[index][c], numeric);
        });
    }
}
