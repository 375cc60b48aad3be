use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Missing Body")]
    MissingBody,
    #[error("Invalid JSON")]
    InvalidJson,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),
    #[error("Not Found")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ControlError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::InvalidRequest(InvalidRequest::MethodNotAllowed) => 405,
            Self::InvalidRequest(_) => 400,
            Self::NotFound => 404,
            Self::Transport(_) => 502,
        }
    }
}
