//! User configuration
//!
//! `jab.toml` carries printer knobs and the module load path:
//!
//! ```toml
//! obase = 16
//! omode = "tree"
//! omaps = true
//! load_path = "~/.jab:%DATADIR%"
//! ```

use std::path::Path;

use jab_runtime::{OMode, Vm};
use serde::Deserialize;

use crate::driver::Compiler;
use crate::error::CompileError;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JabConfig {
    /// Printer base: 2, 8, 10 or 16.
    pub obase: Option<u32>,
    /// "flat" or "tree".
    pub omode: Option<String>,
    pub omaps: Option<bool>,
    pub oindent: Option<u32>,
    pub odepth: Option<u32>,
    pub oacutoff: Option<u32>,
    pub pretty_print: Option<bool>,
    /// `:`-separated module search path; `%DATADIR%` expands to the
    /// configured data directory.
    pub load_path: Option<String>,
}

impl JabConfig {
    pub fn load(path: &Path) -> Result<Self, CompileError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            CompileError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })
    }

    /// Apply the configured knobs.
    pub fn apply(&self, vm: &mut Vm, compiler: &mut Compiler) {
        if let Some(b) = self.obase {
            if matches!(b, 2 | 8 | 10 | 16) {
                vm.knobs.obase = b;
            }
        }
        if let Some(m) = &self.omode {
            vm.knobs.omode = if m == "tree" { OMode::Tree } else { OMode::Flat };
        }
        if let Some(m) = self.omaps {
            vm.knobs.omaps = m;
        }
        if let Some(i) = self.oindent {
            vm.knobs.oindent = i;
        }
        if let Some(d) = self.odepth {
            vm.knobs.odepth = d;
        }
        if let Some(a) = self.oacutoff {
            vm.knobs.oacutoff = a;
        }
        if let Some(p) = self.pretty_print {
            vm.knobs.pretty_print = p;
        }
        if let Some(lp) = &self.load_path {
            compiler.set_load_path(lp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let cfg: JabConfig =
            toml::from_str("obase = 16\nomode = \"tree\"\nomaps = true\n").unwrap();
        assert_eq!(cfg.obase, Some(16));
        assert_eq!(cfg.omode.as_deref(), Some("tree"));
        assert_eq!(cfg.omaps, Some(true));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let r: Result<JabConfig, _> = toml::from_str("not_a_knob = 1\n");
        assert!(r.is_err());
    }
}
