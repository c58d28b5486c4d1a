use crate::agent::AgentProperties;
use crate::error::RuntimeError;

/// Whether the driver got every CU that was asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CuMaskOutcome {
    Applied,
    /// The agent's global mask removed some requested CUs.
    Reduced,
}

const EVEN_BITS: u32 = 0x5555_5555;

/// Intersects `requested` with the global mask and the physical CUs.
///
/// From gfx10 on CUs come in pairs and a mask that splits a pair is rejected.
pub fn effective_mask(
    props: &AgentProperties,
    requested: &[u32],
    global: Option<&[u32]>,
) -> Result<(Vec<u32>, CuMaskOutcome), RuntimeError> {
    if props.requires_paired_cus()
        && requested
            .iter()
            .any(|&w| (w & EVEN_BITS) != ((w >> 1) & EVEN_BITS))
    {
        return Err(RuntimeError::InvalidArgument("CU mask splits a WGP pair"));
    }

    let physical = props.full_cu_mask();
    let word = |mask: &[u32], i: usize| mask.get(i).copied().unwrap_or(0);

    let mut reduced = false;
    let mut effective = Vec::with_capacity(physical.len());
    for (i, &phys) in physical.iter().enumerate() {
        let wanted = word(requested, i) & phys;
        let allowed = global.map_or(phys, |g| word(g, i));
        if wanted & !allowed != 0 {
            reduced = true;
        }
        effective.push(wanted & allowed);
    }

    if effective.iter().all(|&w| w == 0) {
        return Err(RuntimeError::InvalidArgument("CU mask selects no CUs"));
    }

    let outcome = if reduced {
        CuMaskOutcome::Reduced
    } else {
        CuMaskOutcome::Applied
    };
    Ok((effective, outcome))
}
