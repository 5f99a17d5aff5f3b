//! Polarization positioning for the test and chamber antennas.

use tracing::{info, warn};

use super::context::SweepContext;
use crate::error::AppResult;
use crate::hardware::MotorSet;
use crate::store::{ConfigStore, ANTENNA_POLARIZATION, CHAMBER_POLARIZATION};

/// Move both polarization motors to `tpolar`/`cpolar`.
///
/// Moves by the difference from the positions recorded in the store. When the
/// recorded positions cannot be read, both motors are re-homed and rotated to
/// the targets from zero.
pub async fn set_polarization(
    motors: &MotorSet,
    store: &dyn ConfigStore,
    tpolar: f64,
    cpolar: f64,
) -> AppResult<()> {
    let recorded = async {
        let tpolar_old = store.get_option(ANTENNA_POLARIZATION).await?;
        let cpolar_old = store.get_option(CHAMBER_POLARIZATION).await?;
        AppResult::Ok((tpolar_old, cpolar_old))
    }
    .await;

    match recorded {
        Ok((tpolar_old, cpolar_old)) => {
            info!(
                "Polarization {} -> {}, {} -> {}",
                tpolar_old, tpolar, cpolar_old, cpolar
            );
            motors
                .test_polarization()
                .rotate_by_degrees(tpolar - tpolar_old)
                .await?;
            motors
                .chamber_polarization()
                .rotate_by_degrees(cpolar - cpolar_old)
                .await?;
        }
        Err(e) => {
            warn!("Recorded polarization unavailable ({}), re-homing", e);
            motors.test_polarization().goto_zero().await?;
            motors.chamber_polarization().goto_zero().await?;
            motors.test_polarization().rotate_by_degrees(tpolar).await?;
            motors.chamber_polarization().rotate_by_degrees(cpolar).await?;
        }
    }
    Ok(())
}

/// Record both polarization targets and commit.
pub async fn record_polarization(store: &mut dyn ConfigStore, tpolar: f64, cpolar: f64) -> AppResult<()> {
    info!("Updating antenna and chamber polarization in the store");
    store.set_option(ANTENNA_POLARIZATION, tpolar).await?;
    store.set_option(CHAMBER_POLARIZATION, cpolar).await?;
    store.commit().await
}

/// Zero the stand rotation, set both polarizations and record them.
pub async fn run_polarization_rotation(ctx: &mut SweepContext, tpolar: f64, cpolar: f64) -> AppResult<()> {
    info!("Test antenna polarization: {}", tpolar);
    info!("Chamber antenna polarization: {}", cpolar);

    ctx.motors.rotation().goto_zero().await?;
    set_polarization(&ctx.motors, ctx.store.as_ref(), tpolar, cpolar).await?;
    record_polarization(ctx.store.as_mut(), tpolar, cpolar).await?;
    info!("Recorded new polarization positions");
    Ok(())
}
