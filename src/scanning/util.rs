use crate::scanning::error::{ScanError, ScanResult};

/// Convert an `Option` into a `ScanResult`, for packet fields which must be
/// present in well-formed traffic.
pub trait Required<T> {
    fn req(self) -> ScanResult<T>;
}

impl<T> Required<T> for Option<T> {
    fn req(self) -> ScanResult<T> {
        self.ok_or(ScanError::MalformedPacket)
    }
}
