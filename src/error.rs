use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Subject must be Math/Maths or English/Eng, got {0:?}")]
    InvalidSubject(String),

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("{0} must be set to reach the score database")]
    MissingSetting(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("No route named {0:?}")]
    UnknownRoute(String),
}
