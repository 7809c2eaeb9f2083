//! Per-family transfer engines (spec.md §5-§7) behind one common trait,
//! mirroring the way the teacher's `installer` crate gives every device
//! family its own module but drives them through a shared
//! `DeviceConnection`-style surface.

pub mod lte;
pub mod mototrbo;
pub mod tetra;

use std::future::Future;

use crate::error::CoreError;
use crate::model::ParsedCodeplug;

/// Identity fields an engine can pull during the probe/identify step,
/// before a full codeplug read is attempted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioIdentification {
    pub family: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub codeplug_version: Option<String>,
}

/// Progress reported during a long-running read/write/verify, as a
/// fraction in `[0.0, 1.0]`.
pub type ProgressCallback<'a> = dyn FnMut(f64) + Send + 'a;

/// Common surface every family engine exposes (spec.md §5-§7). Modeled
/// on the teacher's `DeviceConnection` trait: RPITIT methods rather than
/// a boxed-future macro, so each engine's futures stay concrete.
pub trait Engine {
    fn identify(&mut self) -> impl Future<Output = Result<RadioIdentification, CoreError>> + Send;

    fn read_codeplug(
        &mut self,
        progress: &mut ProgressCallback<'_>,
    ) -> impl Future<Output = Result<ParsedCodeplug, CoreError>> + Send;

    fn write_codeplug(
        &mut self,
        codeplug: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn verify(
        &mut self,
        expected: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> impl Future<Output = Result<bool, CoreError>> + Send;
}
