use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use kubus::Operator;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use secrethub_webhook::admission::SecretHubMutator;
use secrethub_webhook::mutator::{DEFAULT_REGISTRY, Mutator, MutatorConfig, TargetPolicy};
use secrethub_webhook::{Error, manifest};

#[derive(Parser)]
#[command(name = "secrethub-webhook")]
#[command(about = "Kubernetes mutating webhook that wraps containers with `secrethub run`")]
#[command(version)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the admission webhook
    Run {
        #[arg(long, env = "TLS_CERT_PATH")]
        tls_path: Option<PathBuf>,

        #[command(flatten)]
        mutator: MutatorOpts,
    },
    /// Mutate a pod manifest read from FILE or stdin and print the result
    Mutate {
        file: Option<PathBuf>,

        #[command(flatten)]
        mutator: MutatorOpts,
    },
}

#[derive(Args)]
struct MutatorOpts {
    /// Registry the `cli` image is pulled from
    #[arg(long, env = "SECRETHUB_REGISTRY", default_value = DEFAULT_REGISTRY)]
    registry: String,

    #[arg(long, env = "SECRETHUB_TARGET_POLICY", value_enum, default_value_t)]
    target_policy: TargetPolicy,

    /// Expose the webhook name and version to wrapped containers
    #[arg(long, env = "SECRETHUB_APP_INFO")]
    app_info: bool,
}

impl From<MutatorOpts> for MutatorConfig {
    fn from(opts: MutatorOpts) -> Self {
        Self {
            registry: opts.registry,
            policy: opts.target_policy,
            inject_app_info: opts.app_info,
            ..Default::default()
        }
    }
}

type State = ();

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()?;

    match opts.command {
        Command::Run { tls_path, mutator } => {
            let config = MutatorConfig::from(mutator);
            tracing::info!(
                { registry = &config.registry, policy = ?config.policy, app_info = config.inject_app_info },
                "starting secrethub webhook"
            );

            let client = Client::try_default().await?;
            let mut operator = Operator::builder()
                .with_context((client, State::default()))
                .mutator(SecretHubMutator::new(Mutator::new(config)));

            if let Some(tls_path) = tls_path {
                operator = operator.with_tls_certs(tls_path)
            }

            operator.run().await?
        }

        Command::Mutate { file, mutator } => {
            let content = manifest::read(file.as_deref())?;
            let rendered = manifest::render(&Mutator::new(mutator.into()), &content)?;
            std::io::stdout().write_all(rendered.as_bytes())?;
        }
    };

    Ok(())
}
