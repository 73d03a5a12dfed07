//! Threshold a summed plane into raw candidates.

use crate::error::AccelError;
use crate::obs::AccelObs;
use crate::plane::FfdotPlane;
use crate::significance::candidate_sigma;
use crate::types::AccelCand;

/// Append every cell of `ffdot` whose power exceeds the `numharm` stage
/// threshold and whose frequency is searched and not zapped. Returns the
/// number of candidates appended. No de-duplication happens here.
pub fn search_ffdotpows(
    ffdot: &FfdotPlane,
    numharm: u32,
    obs: &AccelObs,
    cands: &mut Vec<AccelCand>,
) -> Result<usize, AccelError> {
    let powcut = obs
        .powcut(numharm)
        .ok_or(AccelError::UnknownStage(numharm))?;
    let numindep = obs
        .numindep(numharm)
        .ok_or(AccelError::UnknownStage(numharm))?;

    let before = cands.len();
    for ((i, j), &power) in ffdot.powers.indexed_iter() {
        if power <= powcut {
            continue;
        }
        let r = ffdot.r_at(i);
        if !obs.in_search_range(r) || obs.is_zapped(r) {
            continue;
        }
        let sigma = candidate_sigma(f64::from(power), numharm, numindep);
        cands.push(AccelCand::new(
            power,
            sigma,
            numharm,
            r,
            f64::from(ffdot.z_at(j)),
        ));
    }
    Ok(cands.len() - before)
}
