//! Protocol dispatcher (spec.md §4.9): probes a host in a fixed engine
//! order and presents a uniform façade over whichever one answers.

use thiserror::Error;
use tokio::net::TcpStream;

use crate::engines::lte::LteEngine;
use crate::engines::mototrbo::MototrboEngine;
use crate::engines::tetra::TetraEngine;
use crate::engines::{Engine, ProgressCallback, RadioIdentification};
use crate::error::CoreError;
use crate::model::ParsedCodeplug;
use crate::xnl::session::XnlSession;
use crate::xnl::DEFAULT_XNL_PORT;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("no engine on this host answered identify")]
    NoEngineMatched,
    #[error("family {0} is serial-only and not reachable over this core")]
    SerialNotSupported(String),
}

impl From<DispatchError> for CoreError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::ConnectionFailed(m) => CoreError::ConnectionFailed(m),
            DispatchError::NoEngineMatched => {
                CoreError::NotSupported("no engine recognized this host".into())
            }
            DispatchError::SerialNotSupported(family) => {
                CoreError::NotSupported(format!("{family} is serial-only"))
            }
        }
    }
}

/// `(prefix, family)` rules checked in order against the identify-time
/// model string (spec.md §4.9). Model prefixes already fold in the
/// trailing dealer code (e.g. `H02RD`) where the spec's source table
/// shows one.
const FAMILY_PREFIXES: &[(&str, &str)] = &[
    ("H02RD", "xpr"),
    ("H98RD", "xpr"),
    ("H99RD", "xpr"),
    ("M27RD", "xpr"),
    ("AAHRD", "xpr"),
    ("APX", "apx"),
    ("H78", "apx"),
    ("H45", "apx"),
    ("M25", "apx"),
    ("MTP", "mtp"),
    ("MTM", "mtp"),
    ("H55", "mtp"),
    ("H56", "mtp"),
    ("LEX", "lex"),
    ("H69", "lex"),
    ("CLP", "clp"),
    ("CLS", "cls"),
    ("DLR", "dlr"),
    ("DTR", "dtr"),
    ("CP", "cp200"),
];

/// Families whose CPS path is serial/USB-only and therefore unreachable
/// through this network-only core.
const SERIAL_ONLY_FAMILIES: &[&str] = &["cp200"];

/// Total and idempotent: every model maps to exactly one family or
/// `None`, independent of how many times it's called.
pub fn family_from_model(model: &str) -> Option<String> {
    FAMILY_PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, family)| family.to_string())
}

/// One of the three live engines, behind a tagged variant rather than a
/// boxed trait object (spec.md §9 "Dynamic polymorphism").
pub enum DispatchedEngine {
    Mototrbo(MototrboEngine<TcpStream>),
    Tetra(TetraEngine<TcpStream>),
    Lte(LteEngine),
}

impl Engine for DispatchedEngine {
    async fn identify(&mut self) -> Result<RadioIdentification, CoreError> {
        match self {
            DispatchedEngine::Mototrbo(e) => e.identify().await,
            DispatchedEngine::Tetra(e) => e.identify().await,
            DispatchedEngine::Lte(e) => e.identify().await,
        }
    }

    async fn read_codeplug(
        &mut self,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<ParsedCodeplug, CoreError> {
        match self {
            DispatchedEngine::Mototrbo(e) => e.read_codeplug(progress).await,
            DispatchedEngine::Tetra(e) => e.read_codeplug(progress).await,
            DispatchedEngine::Lte(e) => e.read_codeplug(progress).await,
        }
    }

    async fn write_codeplug(
        &mut self,
        codeplug: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), CoreError> {
        match self {
            DispatchedEngine::Mototrbo(e) => e.write_codeplug(codeplug, progress).await,
            DispatchedEngine::Tetra(e) => e.write_codeplug(codeplug, progress).await,
            DispatchedEngine::Lte(e) => e.write_codeplug(codeplug, progress).await,
        }
    }

    async fn verify(
        &mut self,
        expected: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<bool, CoreError> {
        match self {
            DispatchedEngine::Mototrbo(e) => e.verify(expected, progress).await,
            DispatchedEngine::Tetra(e) => e.verify(expected, progress).await,
            DispatchedEngine::Lte(e) => e.verify(expected, progress).await,
        }
    }
}

pub struct Dispatcher {
    host: String,
}

impl Dispatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Dispatcher { host: host.into() }
    }

    async fn try_mototrbo(&self) -> Result<(DispatchedEngine, RadioIdentification), DispatchError> {
        let stream = TcpStream::connect((self.host.as_str(), DEFAULT_XNL_PORT))
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        let mut session = XnlSession::new(stream);
        session
            .authenticate()
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        let mut engine = MototrboEngine::new(session);
        let identification = engine
            .identify()
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        Ok((DispatchedEngine::Mototrbo(engine), identification))
    }

    async fn try_lte(&self) -> Result<(DispatchedEngine, RadioIdentification), DispatchError> {
        let mut engine = LteEngine::new(format!("http://{}", self.host));
        let identification = engine
            .identify()
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        Ok((DispatchedEngine::Lte(engine), identification))
    }

    async fn try_tetra(&self) -> Result<(DispatchedEngine, RadioIdentification), DispatchError> {
        let stream = TcpStream::connect((self.host.as_str(), DEFAULT_XNL_PORT))
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        let mut engine = TetraEngine::new(stream);
        let identification = engine
            .identify()
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;
        Ok((DispatchedEngine::Tetra(engine), identification))
    }

    /// Probes MOTOTRBO, then LTE, then TETRA, returning the first engine
    /// whose `identify` succeeds (spec.md §4.9).
    pub async fn detect(&self) -> Result<(DispatchedEngine, RadioIdentification), DispatchError> {
        if let Ok(result) = self.try_mototrbo().await {
            return Self::reject_serial_only(result);
        }
        if let Ok(result) = self.try_lte().await {
            return Self::reject_serial_only(result);
        }
        if let Ok(result) = self.try_tetra().await {
            return Self::reject_serial_only(result);
        }
        Err(DispatchError::NoEngineMatched)
    }

    fn reject_serial_only(
        result: (DispatchedEngine, RadioIdentification),
    ) -> Result<(DispatchedEngine, RadioIdentification), DispatchError> {
        if SERIAL_ONLY_FAMILIES.contains(&result.1.family.as_str()) {
            return Err(DispatchError::SerialNotSupported(result.1.family));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_prefixes_map_to_their_documented_family() {
        assert_eq!(family_from_model("H02RDH9VA1AN").as_deref(), Some("xpr"));
        assert_eq!(family_from_model("APX8000").as_deref(), Some("apx"));
        assert_eq!(family_from_model("MTP6750").as_deref(), Some("mtp"));
        assert_eq!(family_from_model("LEX L11").as_deref(), Some("lex"));
        assert_eq!(family_from_model("CLP1040").as_deref(), Some("clp"));
        assert_eq!(family_from_model("CP200d").as_deref(), Some("cp200"));
    }

    #[test]
    fn unknown_prefix_yields_none() {
        assert_eq!(family_from_model("ZZZ999"), None);
    }

    #[test]
    fn detection_is_idempotent() {
        let model = "H98RDABCDE";
        assert_eq!(family_from_model(model), family_from_model(model));
    }
}
