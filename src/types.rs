use crate::error::DefragError;

pub type DefragResult<T> = Result<T, DefragError>;
pub type VoidResult = Result<(), DefragError>;
