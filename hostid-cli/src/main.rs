// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fs_err as fs;
use host_identity::httpsig::keyid_from_serial;
use host_identity::store::is_expired;
use host_identity::{
    load_credentials_with_tee, open_tee, setup, CancellationToken, EcPublicKey,
    HostIdentityConfig, MetadataStore, PollPolicy, ScepOptions, TeeBackend,
};
use reqwest::Url;
use tracing::{error, info, warn};

/// Host identity utility
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the host key and enroll its certificate
    Setup(SetupArgs),
    /// Sign an HTTP request and print the signature headers
    Sign(SignArgs),
    /// Show the stored host identity
    Show(DirArgs),
}

#[derive(Args)]
struct DirArgs {
    /// directory holding host-identity.key and host-identity.crt
    #[arg(long, env = "HOSTID_METADATA_DIR", default_value = "/var/lib/host-identity")]
    metadata_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Tpm,
    Software,
    Unavailable,
}

#[derive(Args)]
struct TeeArgs {
    #[command(flatten)]
    dir: DirArgs,

    /// TEE backend holding the host key
    #[arg(long, value_enum, default_value_t = Backend::Tpm)]
    backend: Backend,

    /// TPM device node, probed when unset
    #[arg(long)]
    tpm_device: Option<PathBuf>,

    /// restrict the software backend to P-256
    #[arg(long)]
    p256_only: bool,
}

impl TeeArgs {
    fn backend(&self) -> TeeBackend {
        match self.backend {
            Backend::Tpm => TeeBackend::Tpm {
                device: self.tpm_device.clone(),
            },
            Backend::Software => TeeBackend::Software {
                p256_only: self.p256_only,
            },
            Backend::Unavailable => TeeBackend::Unavailable,
        }
    }
}

#[derive(Args)]
/// Provision the host identity
struct SetupArgs {
    #[command(flatten)]
    tee: TeeArgs,

    /// SCEP endpoint
    #[arg(long, env = "HOSTID_SCEP_URL")]
    scep_url: String,

    /// SCEP challenge password
    #[arg(long, env = "HOSTID_SCEP_CHALLENGE", hide_env_values = true)]
    challenge: String,

    /// subject common name of the host certificate
    #[arg(long, env = "HOSTID_COMMON_NAME")]
    common_name: String,

    /// PEM bundle trusted for the SCEP endpoint in addition to the platform roots
    #[arg(long)]
    root_ca: Option<PathBuf>,

    /// skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// also put the challenge password inside the CSR
    #[arg(long)]
    challenge_in_csr: bool,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// bound on the whole enrollment, PENDING rounds included
    #[arg(long, default_value_t = PollPolicy::default().deadline_secs)]
    deadline_secs: u64,
}

#[derive(Args)]
/// Sign an HTTP request
struct SignArgs {
    #[command(flatten)]
    tee: TeeArgs,

    /// request method
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,

    /// request URL
    #[arg(short, long)]
    url: String,

    /// file holding the request body
    #[arg(short, long)]
    body: Option<PathBuf>,
}

fn config_from_args(args: &SetupArgs) -> Result<HostIdentityConfig> {
    let mut scep = ScepOptions::new(&args.scep_url, &args.challenge, &args.common_name);
    if let Some(path) = &args.root_ca {
        scep.root_ca_pem = Some(fs::read_to_string(path)?);
    }
    scep.insecure_transport = args.insecure;
    scep.challenge_in_csr = args.challenge_in_csr;
    scep.request_timeout_secs = args.timeout_secs;
    scep.poll.deadline_secs = args.deadline_secs;
    Ok(HostIdentityConfig {
        metadata_dir: args.tee.dir.metadata_dir.clone(),
        tee: args.tee.backend(),
        scep,
    })
}

async fn cmd_setup(args: SetupArgs) -> Result<()> {
    let config = config_from_args(&args)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling setup");
            trigger.cancel();
        }
    });

    let credentials = setup(&config, &cancel)
        .await
        .context("host identity setup failed")?;
    let signer = credentials.http_signer();
    info!(
        keyid = signer.keyid(),
        curve = %credentials.ecc_algorithm(),
        cert = %credentials.cert_path().display(),
        "host identity ready"
    );
    credentials.close()?;
    Ok(())
}

fn cmd_sign(args: SignArgs) -> Result<()> {
    let url = Url::parse(&args.url).context("invalid URL")?;
    let body = match &args.body {
        Some(path) => fs::read(path)?,
        None => Vec::new(),
    };

    let metadata_dir = &args.tee.dir.metadata_dir;
    let tee = open_tee(&args.tee.backend(), metadata_dir).context("failed to open TEE")?;
    let credentials =
        load_credentials_with_tee(metadata_dir, tee).context("failed to load credentials")?;
    let headers = credentials
        .http_signer()
        .sign_parts(&args.method, &url, &body)
        .context("failed to sign request")?;
    credentials.close()?;

    println!("Content-Digest: {}", headers.content_digest);
    println!("Signature-Input: {}", headers.signature_input);
    println!("Signature: {}", headers.signature);
    Ok(())
}

fn cmd_show(args: DirArgs) -> Result<()> {
    let store = MetadataStore::new(&args.metadata_dir);
    let cert = store.read_cert().context("failed to read certificate")?;
    let tbs = &cert.tbs_certificate;
    let curve = match EcPublicKey::from_spki(&tbs.subject_public_key_info) {
        Ok(key) => key.algorithm().to_string(),
        Err(e) => format!("unsupported ({e})"),
    };
    let key_state = if store.key_path().exists() {
        "present"
    } else {
        "missing"
    };

    println!("subject:     {}", tbs.subject);
    println!("issuer:      {}", tbs.issuer);
    println!("keyid:       {}", keyid_from_serial(&tbs.serial_number));
    println!("curve:       {curve}");
    println!("not before:  {}", tbs.validity.not_before);
    println!("not after:   {}", tbs.validity.not_after);
    println!("expired:     {}", is_expired(&cert, SystemTime::now()));
    println!("certificate: {}", store.cert_path().display());
    println!("key:         {} ({key_state})", store.key_path().display());
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Setup(args) => cmd_setup(args).await?,
        Commands::Sign(args) => cmd_sign(args)?,
        Commands::Show(args) => cmd_show(args)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_setup_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "hostid",
            "setup",
            "--metadata-dir",
            "/tmp/hostid",
            "--backend",
            "software",
            "--p256-only",
            "--scep-url",
            "http://scep.test/scep",
            "--challenge",
            "secret",
            "--common-name",
            "fleet-device",
            "--insecure",
            "--deadline-secs",
            "5",
        ])
        .unwrap();
        let Commands::Setup(args) = cli.command else {
            panic!("expected setup");
        };
        let config = config_from_args(&args).unwrap();
        assert_eq!(config.metadata_dir, PathBuf::from("/tmp/hostid"));
        assert_eq!(config.tee, TeeBackend::Software { p256_only: true });
        assert_eq!(config.scep.server_url, "http://scep.test/scep");
        assert_eq!(config.scep.common_name, "fleet-device");
        assert!(config.scep.insecure_transport);
        assert!(!config.scep.challenge_in_csr);
        assert_eq!(config.scep.poll.deadline_secs, 5);
        assert_eq!(config.scep.request_timeout_secs, 30);
    }
}
