use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

/// Signal generated on a simulated device's inputs. Every input channel carries the same signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    Silence,
    Sine { frequency: f64, amplitude: f64 },
    Constant(f64),
}

impl Signal {
    /// Value at absolute frame `position`.
    pub fn value(&self, rate: u32, position: u64) -> f64 {
        match *self {
            Signal::Silence => 0.0,
            Signal::Sine {
                frequency,
                amplitude,
            } => {
                let t = position as f64 / rate as f64;
                amplitude * (TAU * frequency * t).sin()
            }
            Signal::Constant(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_quarter_period() {
        let sine = Signal::Sine {
            frequency: 1.0,
            amplitude: 0.5,
        };

        assert_eq!(sine.value(4, 0), 0.0);
        assert!((sine.value(4, 1) - 0.5).abs() < 1e-12);
        assert!((sine.value(4, 3) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn constant_and_silence() {
        assert_eq!(Signal::Constant(0.25).value(48000, 123), 0.25);
        assert_eq!(Signal::Silence.value(48000, 123), 0.0);
    }
}
