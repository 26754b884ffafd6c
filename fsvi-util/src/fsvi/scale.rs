use std::fmt;
use std::str::FromStr;

use candle_core::{bail, Error, Result};

/// Weight applied to the function-space KL term of the ELBO
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KlScale {
    /// 1
    None,
    /// batch size / number of inducing points
    Equal,
    /// 1 / number of inducing points
    Normalized,
    /// a literal constant
    Fixed(f64),
}

impl KlScale {
    /// Scale for a minibatch of `batch_size` and `n_inducing` inducing inputs
    pub fn scale(&self, batch_size: usize, n_inducing: usize) -> Result<f64> {
        match self {
            KlScale::None => Ok(1.0),
            KlScale::Fixed(s) => Ok(*s),
            KlScale::Equal | KlScale::Normalized if n_inducing == 0 => {
                bail!("kl scale `{}` needs at least one inducing point", self)
            }
            KlScale::Equal => Ok(batch_size as f64 / n_inducing as f64),
            KlScale::Normalized => Ok(1.0 / n_inducing as f64),
        }
    }
}

impl FromStr for KlScale {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "none" => Ok(KlScale::None),
            "equal" => Ok(KlScale::Equal),
            "normalized" => Ok(KlScale::Normalized),
            other => match other.parse::<f64>() {
                Ok(s) if s.is_finite() => Ok(KlScale::Fixed(s)),
                _ => Err(Error::Msg(format!(
                    "unrecognized kl scale `{}`: expected none, equal, normalized or a number",
                    other
                ))),
            },
        }
    }
}

impl fmt::Display for KlScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KlScale::None => write!(f, "none"),
            KlScale::Equal => write!(f, "equal"),
            KlScale::Normalized => write!(f, "normalized"),
            KlScale::Fixed(s) => write!(f, "{}", s),
        }
    }
}

/// Parse `mode` and evaluate the KL scale in one go
pub fn compute_scale(mode: &str, batch_size: usize, n_inducing: usize) -> Result<f64> {
    mode.parse::<KlScale>()?.scale(batch_size, n_inducing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords() -> Result<()> {
        assert_eq!(compute_scale("none", 32, 16)?, 1.0);
        assert_eq!(compute_scale("equal", 32, 16)?, 2.0);
        assert_eq!(compute_scale("normalized", 32, 16)?, 1.0 / 16.0);
        assert_eq!(compute_scale("equal", 10, 3)?, 10.0 / 3.0);
        Ok(())
    }

    #[test]
    fn test_numeric() -> Result<()> {
        assert_eq!(compute_scale("0.5", 32, 16)?, 0.5);
        assert_eq!(compute_scale("1e-3", 1, 1)?, 1e-3);
        assert_eq!("2".parse::<KlScale>()?, KlScale::Fixed(2.0));
        Ok(())
    }

    #[test]
    fn test_bad_modes() {
        assert!(compute_scale("sometimes", 32, 16).is_err());
        assert!(compute_scale("", 32, 16).is_err());
        assert!(compute_scale("nan", 32, 16).is_err());
        assert!(compute_scale("equal", 32, 0).is_err());
        assert!(compute_scale("normalized", 32, 0).is_err());
    }

    #[test]
    fn test_display_round_trip() -> Result<()> {
        for mode in ["none", "equal", "normalized", "0.25"] {
            assert_eq!(mode.parse::<KlScale>()?.to_string(), mode);
        }
        Ok(())
    }
}
