use core::fmt;

/// How a piece of source is meant to be run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// A module: a sequence of statements.
    #[default]
    Exec,
    /// A single expression whose value is returned.
    Eval,
    /// Interactive input: expression statements print their value.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mode must be 'exec', 'eval' or 'single'")]
pub struct ModeParseError;

impl core::str::FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exec" => Ok(Self::Exec),
            "eval" => Ok(Self::Eval),
            "single" => Ok(Self::Single),
            _ => Err(ModeParseError),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exec => "exec",
            Self::Eval => "eval",
            Self::Single => "single",
        })
    }
}
