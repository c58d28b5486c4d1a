//! Process-wide runtime settings read from the environment.

use std::collections::BTreeMap;

/// Global CU mask per GPU: `"<gpu>:<cu-list>[;<gpu>:<cu-list>...]"`, where a CU list is a comma
/// separated list of indices and `first-last` ranges.
pub const CU_MASK_ENV: &str = "HSA_CU_MASK";
/// Scratch allocations above this many bytes are "large".
pub const SCRATCH_SINGLE_LIMIT_ENV: &str = "HSA_SCRATCH_SINGLE_LIMIT";
/// Whether large scratch allocations are marked single-use so the driver can reclaim them.
pub const SCRATCH_ASYNC_RECLAIM_ENV: &str = "HSA_ENABLE_SCRATCH_ASYNC_RECLAIM";
/// Whether queue faults are logged at error level.
pub const QUEUE_FAULT_MESSAGE_ENV: &str = "HSA_ENABLE_QUEUE_FAULT_MESSAGE";

pub const DEFAULT_SCRATCH_SINGLE_LIMIT: u64 = 146_800_640;

/// Highest CU index accepted in a mask.
const MAX_CU_INDEX: u32 = 4095;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a boolean")]
    Bool { var: &'static str, value: String },
    #[error("{var}={value:?} is not an unsigned integer")]
    Integer { var: &'static str, value: String },
    #[error("{CU_MASK_ENV}: {0}")]
    CuMask(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub cu_masks: BTreeMap<u32, Vec<u32>>,
    pub scratch_single_limit: u64,
    pub scratch_async_reclaim: bool,
    pub queue_fault_messages: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cu_masks: BTreeMap::new(),
            scratch_single_limit: DEFAULT_SCRATCH_SINGLE_LIMIT,
            scratch_async_reclaim: true,
            queue_fault_messages: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(CU_MASK_ENV) {
            config.cu_masks = parse_cu_masks(&raw)?;
        }
        if let Some(raw) = lookup(SCRATCH_SINGLE_LIMIT_ENV) {
            config.scratch_single_limit = parse_u64(SCRATCH_SINGLE_LIMIT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(SCRATCH_ASYNC_RECLAIM_ENV) {
            config.scratch_async_reclaim = parse_bool(SCRATCH_ASYNC_RECLAIM_ENV, &raw)?;
        }
        if let Some(raw) = lookup(QUEUE_FAULT_MESSAGE_ENV) {
            config.queue_fault_messages = parse_bool(QUEUE_FAULT_MESSAGE_ENV, &raw)?;
        }

        Ok(config)
    }

    /// Global mask for GPU `node`, one bit per CU.
    pub fn cu_mask_for(&self, node: u32) -> Option<&[u32]> {
        self.cu_masks.get(&node).map(Vec::as_slice)
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    let v = raw.trim();
    if v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("on") {
        return Ok(true);
    }
    if v == "0" || v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("no") || v.eq_ignore_ascii_case("off") {
        return Ok(false);
    }
    Err(ConfigError::Bool {
        var,
        value: raw.to_owned(),
    })
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Integer {
        var,
        value: raw.to_owned(),
    })
}

fn parse_cu_index(raw: &str) -> Result<u32, ConfigError> {
    let index: u32 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::CuMask(format!("{raw:?} is not a CU index")))?;
    if index > MAX_CU_INDEX {
        return Err(ConfigError::CuMask(format!("CU index {index} is out of range")));
    }
    Ok(index)
}

pub(crate) fn parse_cu_masks(raw: &str) -> Result<BTreeMap<u32, Vec<u32>>, ConfigError> {
    let mut masks = BTreeMap::new();

    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (gpu, list) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::CuMask(format!("{entry:?} lacks a ':'")))?;
        let gpu: u32 = gpu
            .trim()
            .parse()
            .map_err(|_| ConfigError::CuMask(format!("{gpu:?} is not a GPU index")))?;

        let mut words: Vec<u32> = Vec::new();
        for item in list.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (first, last) = match item.split_once('-') {
                Some((a, b)) => (parse_cu_index(a)?, parse_cu_index(b)?),
                None => {
                    let cu = parse_cu_index(item)?;
                    (cu, cu)
                }
            };
            if first > last {
                return Err(ConfigError::CuMask(format!("range {item:?} is reversed")));
            }
            for cu in first..=last {
                let word = (cu / 32) as usize;
                if words.len() <= word {
                    words.resize(word + 1, 0);
                }
                words[word] |= 1 << (cu % 32);
            }
        }

        if masks.insert(gpu, words).is_some() {
            return Err(ConfigError::CuMask(format!("GPU {gpu} listed twice")));
        }
    }

    Ok(masks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RuntimeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        assert_eq!(config(&[]).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn cu_mask_ranges_and_singles() {
        let cfg = config(&[(CU_MASK_ENV, "0:0-3,8; 1:33")]).unwrap();
        assert_eq!(cfg.cu_mask_for(0), Some(&[0x10F][..]));
        assert_eq!(cfg.cu_mask_for(1), Some(&[0, 0b10][..]));
        assert_eq!(cfg.cu_mask_for(2), None);
    }

    #[test]
    fn cu_mask_rejects_garbage() {
        assert!(config(&[(CU_MASK_ENV, "0-3")]).is_err());
        assert!(config(&[(CU_MASK_ENV, "0:5-2")]).is_err());
        assert!(config(&[(CU_MASK_ENV, "0:1;0:2")]).is_err());
        assert!(config(&[(CU_MASK_ENV, "0:9999")]).is_err());
    }

    #[test]
    fn booleans_and_integers() {
        let cfg = config(&[
            (SCRATCH_SINGLE_LIMIT_ENV, " 65536 "),
            (SCRATCH_ASYNC_RECLAIM_ENV, "off"),
            (QUEUE_FAULT_MESSAGE_ENV, "No"),
        ])
        .unwrap();
        assert_eq!(cfg.scratch_single_limit, 65536);
        assert!(!cfg.scratch_async_reclaim);
        assert!(!cfg.queue_fault_messages);

        assert!(matches!(
            config(&[(QUEUE_FAULT_MESSAGE_ENV, "maybe")]),
            Err(ConfigError::Bool { .. })
        ));
        assert!(matches!(
            config(&[(SCRATCH_SINGLE_LIMIT_ENV, "-1")]),
            Err(ConfigError::Integer { .. })
        ));
    }
}
