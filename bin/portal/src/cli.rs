use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// VeilNet portal: route a host network into a VeilNet overlay
#[derive(Debug, Parser)]
#[command(name = "veilnet-portal")]
#[command(version, about)]
pub(crate) struct Cli {
    /// Configuration file (defaults to ./config.yaml)
    #[arg(short, long, env = "VEILNET_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Guardian (coordination service) URL
    #[arg(long, env = "VEILNET_GUARDIAN_URL")]
    pub(crate) guardian_url: Option<String>,

    /// Anchor credential
    #[arg(long, env = "VEILNET_ANCHOR_TOKEN", hide_env_values = true)]
    pub(crate) anchor_token: Option<String>,

    /// Anchor name shown on the overlay
    #[arg(long, env = "VEILNET_ANCHOR_NAME")]
    pub(crate) anchor_name: Option<String>,

    /// Overlay domain name
    #[arg(long, env = "VEILNET_DOMAIN_NAME")]
    pub(crate) domain_name: Option<String>,

    /// Deployment region
    #[arg(long, env = "VEILNET_REGION")]
    pub(crate) region: Option<String>,

    /// Advertise this portal to the overlay
    #[arg(long, env = "VEILNET_PUBLIC")]
    pub(crate) public: Option<bool>,

    /// Expected host uplink interface
    #[arg(long, env = "VEILNET_HOST_INTERFACE")]
    pub(crate) host_interface: Option<String>,

    /// Status page listen address
    #[arg(long, env = "VEILNET_STATUS_BIND")]
    pub(crate) status_bind: Option<SocketAddr>,
}

/// Parse `args` with every `VEILNET_*` binding removed, so the result does
/// not depend on the caller's environment
#[cfg(test)]
pub(crate) fn parse_without_env<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    use clap::{CommandFactory, FromArgMatches};

    const ENV_ARGS: &[&str] = &[
        "config",
        "guardian_url",
        "anchor_token",
        "anchor_name",
        "domain_name",
        "region",
        "public",
        "host_interface",
        "status_bind",
    ];

    let mut command = Cli::command();
    for id in ENV_ARGS {
        command = command.mut_arg(*id, |arg| arg.env(None::<&'static str>));
    }
    let matches = command
        .try_get_matches_from(args)
        .expect("arguments should parse");
    Cli::from_arg_matches(&matches).expect("matches should convert")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_overrides() {
        let cli = parse_without_env([
            "veilnet-portal",
            "-vv",
            "--config",
            "/etc/veilnet/portal.yaml",
            "--anchor-name",
            "edge-1",
            "--public",
            "false",
            "--status-bind",
            "127.0.0.1:8080",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/veilnet/portal.yaml")));
        assert_eq!(cli.anchor_name.as_deref(), Some("edge-1"));
        assert_eq!(cli.public, Some(false));
        assert_eq!(cli.status_bind, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_isolated_parse_ignores_environment() {
        std::env::set_var("VEILNET_REGION", "from-env");
        let cli = parse_without_env(["veilnet-portal"]);
        std::env::remove_var("VEILNET_REGION");

        assert_eq!(cli.region, None);
        assert_eq!(cli.public, None);
    }
}
