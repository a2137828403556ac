use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};

use quorum_engine::airgapped::Machine;
use quorum_engine::logging::{init_logging, LogFormat};
use quorum_engine::types::Operation;

#[derive(Parser)]
#[command(
    name = "quorum-airgap",
    version,
    about = "Air-gapped side of the threshold signing quorum"
)]
struct Cli {
    /// Keystore directory.
    #[arg(long, default_value = "quorum-keystore")]
    db: PathBuf,

    /// Where reply files are written.
    #[arg(long, default_value = ".")]
    result_folder: PathBuf,

    /// Passphrase protecting keyrings at rest; required by commands that
    /// touch key material.
    #[arg(long)]
    passphrase: Option<String>,

    /// Write logs as JSON.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or load) the long-term keypair and print the public key.
    InitKeys,
    /// Print the long-term public key used for enrollment.
    ShowPubkey,
    /// Execute one operation file and write its reply next to the result
    /// folder.
    ProcessOperation {
        /// JSON operation file handed over the air gap.
        file: PathBuf,
    },
    /// Replay the stored operation log of a round.
    Replay {
        dkg_id: String,
    },
    /// Verify a recovered group signature for a round.
    VerifySignature {
        dkg_id: String,
        /// Message that was signed (UTF-8).
        msg: String,
        /// Hex-encoded signature.
        sig: String,
    },
    /// Remove the stored operation log of a round.
    DropOperationsLog {
        dkg_id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let _guard = init_logging(Some(std::path::Path::new("logs")), format);

    let machine = match Machine::new(&cli.db, cli.result_folder.clone()) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("failed to open keystore: {err}");
            exit(1);
        }
    };

    if let Some(passphrase) = &cli.passphrase {
        if let Err(err) = machine.set_encryption_key(passphrase.as_bytes()) {
            eprintln!("failed to set encryption key: {err}");
            exit(1);
        }
    }

    match cli.command {
        Commands::InitKeys | Commands::ShowPubkey => {
            if let Err(err) = machine.init_keys() {
                eprintln!("failed to init keys: {err}");
                exit(1);
            }
            match machine.pub_key_bytes() {
                Ok(pub_key) => println!("public key: {}", hex::encode(pub_key)),
                Err(err) => {
                    eprintln!("failed to load public key: {err}");
                    exit(1);
                }
            }
        }

        Commands::ProcessOperation { file } => {
            if let Err(err) = machine.init_keys() {
                eprintln!("failed to init keys: {err}");
                exit(1);
            }
            let raw = match std::fs::read(&file) {
                Ok(raw) => raw,
                Err(err) => {
                    eprintln!("failed to read operation file {}: {err}", file.display());
                    exit(1);
                }
            };
            let operation: Operation = match serde_json::from_slice(&raw) {
                Ok(operation) => operation,
                Err(err) => {
                    eprintln!("failed to decode operation: {err}");
                    exit(1);
                }
            };
            tracing::info!(
                operation = %operation.id,
                payload_digest = %blake3::hash(&operation.payload).to_hex(),
                "processing operation"
            );
            match machine.process_operation(operation, true) {
                Ok(path) => println!("reply written to: {}", path.display()),
                Err(err) => {
                    eprintln!("failed to process operation: {err}");
                    exit(1);
                }
            }
        }

        Commands::Replay { dkg_id } => {
            if let Err(err) = machine.init_keys() {
                eprintln!("failed to init keys: {err}");
                exit(1);
            }
            match machine.replay_operations_log(&dkg_id) {
                Ok(paths) => {
                    for path in paths {
                        println!("reply written to: {}", path.display());
                    }
                }
                Err(err) => {
                    eprintln!("failed to replay operation log: {err}");
                    exit(1);
                }
            }
        }

        Commands::VerifySignature { dkg_id, msg, sig } => {
            let signature = match hex::decode(&sig) {
                Ok(signature) => signature,
                Err(err) => {
                    eprintln!("invalid signature hex: {err}");
                    exit(1);
                }
            };
            tracing::info!(
                message_digest = %blake3::hash(msg.as_bytes()).to_hex(),
                "verifying signature"
            );
            match machine.verify_sign(msg.as_bytes(), &signature, &dkg_id) {
                Ok(()) => println!("signature verified"),
                Err(err) => {
                    eprintln!("invalid signature: {err}");
                    exit(1);
                }
            }
        }

        Commands::DropOperationsLog { dkg_id } => {
            if let Err(err) = machine.drop_operations_log(&dkg_id) {
                eprintln!("failed to drop operation log: {err}");
                exit(1);
            }
            println!("operation log dropped for round {dkg_id}");
        }
    }
}
