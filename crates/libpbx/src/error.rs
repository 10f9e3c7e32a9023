#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("extension {0} is out of range")]
    ExtensionOutOfRange(u16),

    #[error("extension {0} is already taken")]
    ExtensionOccupied(u16),

    #[error("no vacant extensions")]
    RegistryFull,

    #[error("telephone unit is not registered")]
    NotRegistered,

    #[error("telephone unit is not connected")]
    NotConnected,

    #[error("peer client is gone")]
    ClientGone,
}

pub type Result<T> = core::result::Result<T, Error>;
