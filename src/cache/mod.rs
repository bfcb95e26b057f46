//! Dataset splits: raw dataset loading, preprocessing and the redb-backed
//! split cache.

pub mod datasets;
pub mod preprocess;
mod store;

pub use datasets::DatasetCatalog;
pub use preprocess::{PasswordLists, Pipeline, PreprocessStep};
pub use store::{CacheStats, DatasetSplit, SplitCache};

use crate::error::Result;
use crate::types::RunSpec;

/// Load the raw password lists a run starts from.
///
/// The test list is empty unless `test_datasets` names an explicit
/// cross-dataset test set.
pub fn load_raw(catalog: &DatasetCatalog, spec: &RunSpec) -> Result<PasswordLists> {
    let train = catalog.load(&spec.require_text("train_datasets")?)?;
    let test = match spec.text("test_datasets") {
        Some(names) => catalog.load(&names)?,
        None => Vec::new(),
    };
    Ok(PasswordLists::new(train, test))
}
