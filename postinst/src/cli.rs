//! Command-line argument parsing.
//!
//! The finalizer is invoked by the update engine as
//! `coreup-postinst <target_device> KERNEL=<name> [KEY=VALUE]...`.
//! Unknown KEY=VALUE tokens are ignored so the invocation contract can
//! grow without breaking older finalizers.

use std::path::PathBuf;

use clap::Parser;

/// coreup post-install finalizer - arms the freshly written slot
#[derive(Parser, Debug)]
#[command(name = "coreup-postinst")]
#[command(about = "coreup post-install finalizer - arms the freshly written slot")]
#[command(version)]
pub struct Args {
    /// Target slot device that received the update payload
    pub target_device: PathBuf,

    /// KEY=VALUE tokens from the invoking engine
    pub tokens: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Kernel file name announced by the engine; defaults to "vmlinuz".
    pub fn kernel_name(&self) -> &str {
        self.value_of("KERNEL").unwrap_or("vmlinuz")
    }

    fn value_of(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|token| {
            let (k, v) = token.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_token_parsing() {
        let args = Args::parse_from([
            "coreup-postinst",
            "/dev/vda4",
            "KERNEL=vmlinuz-5.15",
            "IGNORED=yes",
        ]);
        assert_eq!(args.target_device, PathBuf::from("/dev/vda4"));
        assert_eq!(args.kernel_name(), "vmlinuz-5.15");
    }

    #[test]
    fn test_kernel_defaults_when_absent() {
        let args = Args::parse_from(["coreup-postinst", "/dev/vda4"]);
        assert_eq!(args.kernel_name(), "vmlinuz");
    }

    #[test]
    fn test_unknown_tokens_are_ignored() {
        let args = Args::parse_from(["coreup-postinst", "/dev/vda4", "FOO=bar", "BAZ=1"]);
        assert_eq!(args.kernel_name(), "vmlinuz");
        assert_eq!(args.tokens.len(), 2);
    }
}
