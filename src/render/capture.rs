//! Materialization of DICOM-carrying response buffers.

use std::fs;
use std::path::Path;

use dicom::dictionary_std::tags;
use tracing::debug;

use crate::error::Result;
use crate::loader::{element_string, read_dicom_bytes};

/// Parse `buffer` as a DICOM file to validate it, then write it verbatim.
///
/// Returns the SOPInstanceUID of the written dataset, if it has one.
pub fn write_dataset(buffer: &[u8], path: &Path) -> Result<Option<String>> {
    let obj = read_dicom_bytes(buffer)?;
    let instance_uid = element_string(&obj, tags::SOP_INSTANCE_UID);
    fs::write(path, buffer)?;
    debug!(
        "Wrote {} byte dataset {:?} to {path:?}",
        buffer.len(),
        instance_uid.as_deref().unwrap_or("<no uid>")
    );
    Ok(instance_uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SyntheticInstance;
    use dicom::object::open_file;
    use tempfile::TempDir;

    #[test]
    fn writes_valid_dataset_verbatim() {
        let dir = TempDir::new().unwrap();
        let bytes = SyntheticInstance::new(2, 1, vec![1, 2])
            .instance_uid("1.2.840.99")
            .to_bytes()
            .unwrap();
        let path = dir.path().join("sc_0.dcm");

        let uid = write_dataset(&bytes, &path).unwrap();
        assert_eq!(uid.as_deref(), Some("1.2.840.99"));
        assert_eq!(fs::read(&path).unwrap(), bytes);
        assert!(open_file(&path).is_ok());
    }

    #[test]
    fn rejects_garbage_without_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sc_0.dcm");
        assert!(write_dataset(b"definitely not dicom", &path).is_err());
        assert!(!path.exists());
    }
}
