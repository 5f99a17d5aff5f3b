//! Session resources shared by every chamber procedure.

use tracing::{info, warn};

use crate::error::{AppResult, ChamberError};
use crate::hardware::MotorSet;
use crate::instrument::VnaSession;
use crate::store::ConfigStore;

/// Motors, analyzer and configuration store for one run.
///
/// Procedures borrow the context mutably; [`SweepContext::shutdown`] must be
/// called on every exit path to release the hardware.
pub struct SweepContext {
    pub motors: MotorSet,
    pub vna: VnaSession,
    pub store: Box<dyn ConfigStore>,
}

impl SweepContext {
    pub fn new(motors: MotorSet, vna: VnaSession, store: Box<dyn ConfigStore>) -> Self {
        Self { motors, vna, store }
    }

    /// Release motors, analyzer and store. Every step runs even when an
    /// earlier one fails; failures are returned together.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        info!("Shutting down chamber session");
        let mut errors = Vec::new();

        if let Err(e) = self.motors.shutdown().await {
            warn!("Motor shutdown failed: {}", e);
            errors.push(e);
        }
        if let Err(e) = self.vna.shutdown().await {
            warn!("Network analyzer shutdown failed: {}", e);
            errors.push(e);
        }
        if let Err(e) = self.store.close().await {
            warn!("Configuration store close failed: {}", e);
            errors.push(e);
        }

        collect(errors)
    }

    /// Shut down, then report the procedure's own error first if it had one.
    pub async fn finish<T>(&mut self, outcome: AppResult<T>) -> AppResult<T> {
        let shutdown = self.shutdown().await;
        match (outcome, shutdown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("Cleanup after failure also failed: {}", cleanup);
                Err(e)
            }
        }
    }
}

fn collect(errors: Vec<ChamberError>) -> AppResult<()> {
    let mut flat = Vec::with_capacity(errors.len());
    for error in errors {
        match error {
            ChamberError::ShutdownFailed(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    if flat.is_empty() {
        Ok(())
    } else {
        Err(ChamberError::ShutdownFailed(flat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotorController;
    use crate::hardware::MotorProtocol;
    use crate::instrument::mock::MockVna;
    use crate::instrument::VnaTiming;
    use crate::store::MemoryConfigStore;
    use std::time::Duration;

    fn context(motor_bus: &MockMotorController, vna: &MockVna) -> SweepContext {
        let protocol = MotorProtocol::new(Box::new(motor_bus.clone()), Duration::from_millis(10));
        SweepContext::new(
            MotorSet::new(protocol).unwrap(),
            VnaSession::new(Box::new(vna.clone()), VnaTiming::immediate()),
            Box::new(MemoryConfigStore::new()),
        )
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let bus = MockMotorController::new();
        let vna = MockVna::new();
        let mut ctx = context(&bus, &vna);

        ctx.shutdown().await.unwrap();
        assert_eq!(bus.commands().await, vec!["Q"]);
        assert!(bus.is_closed().await);
        assert!(vna.is_closed().await);
        assert_eq!(vna.writes().await, vec![":DISP:ENAB ON"]);
    }

    #[tokio::test]
    async fn test_shutdown_collects_failures() {
        let bus = MockMotorController::new();
        let vna = MockVna::new();
        vna.fail_on(":DISP:ENAB").await;
        let mut ctx = context(&bus, &vna);
        bus.disconnect().await;

        let err = ctx.shutdown().await.unwrap_err();
        match err {
            ChamberError::ShutdownFailed(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(vna.is_closed().await);
    }

    #[tokio::test]
    async fn test_finish_prefers_procedure_error() {
        let bus = MockMotorController::new();
        let vna = MockVna::new();
        let mut ctx = context(&bus, &vna);

        let outcome: AppResult<()> = Err(ChamberError::Validation("bad".to_string()));
        let err = ctx.finish(outcome).await.unwrap_err();
        assert!(matches!(err, ChamberError::Validation(_)));
        assert!(bus.is_closed().await);
    }
}
