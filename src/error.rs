pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("identity key mismatch for peer device {0}")]
    IdentityMismatch(String),

    #[error("cryptographic operation failed: {0}")]
    CryptoFail(String),

    #[error("malformed buffer: {0}")]
    SerializationFail(String),

    #[error("storage failure: {0}")]
    StorageFail(String),

    #[error("server returned {code}: {detail}")]
    ServerFail { code: u16, detail: String },

    #[error("message could not be decrypted")]
    DecryptFail,
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::StorageFail(value.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(value: ed25519_dalek::SignatureError) -> Self {
        Self::CryptoFail(value.to_string())
    }
}
