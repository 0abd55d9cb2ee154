use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid job key: {0}")]
    InvalidJobKey(String),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),
}
