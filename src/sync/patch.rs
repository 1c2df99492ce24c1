use tracing::trace;

use super::protocol::PatchOperation;
use crate::storage::db::Write;
use crate::types::Result;

/// Applies a pull patch to a snapshot under construction, in order.
pub fn apply_patch(write: &mut Write<'_>, patch: &[PatchOperation]) -> Result<()> {
    for op in patch {
        match op {
            PatchOperation::Put { key, value } => write.put(key, value.clone())?,
            PatchOperation::Del { key } => {
                write.del(key)?;
            }
            PatchOperation::Clear => write.clear()?,
        }
    }
    trace!(ops = patch.len(), "sync.patch.applied");
    Ok(())
}
