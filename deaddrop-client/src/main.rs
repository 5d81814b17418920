use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand, ValueEnum};
use deaddrop_client::{
    DirectorySaver, FeedbackSequencer, HttpTransport, SelectedFile, SystemClipboard,
    TransferController,
    settings::{ClientSettings, SettingsStore},
};
use deaddrop_core::{DropZone, FeedbackKind, TransferState, TransferStatus};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "deaddrop", about = "Drop a file for pickup, or pick one up by key")]
struct ClientArgs {
    /// Base URL of the deaddrop service (overrides saved settings).
    #[arg(long, global = true)]
    server_url: Option<String>,

    #[command(subcommand)]
    command: ClientCommand,
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// Upload a file and print its pickup key. Only the first file is sent.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Copy the pickup key or the share link to the clipboard.
        #[arg(long, value_enum)]
        copy: Option<CopyTarget>,
    },
    /// Redeem a pickup key and save the file locally.
    Download {
        pickup_key: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Show or update saved settings.
    Config {
        #[arg(long)]
        set_server_url: Option<String>,
        #[arg(long)]
        set_download_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CopyTarget {
    Id,
    Link,
}

impl From<CopyTarget> for FeedbackKind {
    fn from(target: CopyTarget) -> Self {
        match target {
            CopyTarget::Id => FeedbackKind::CopyId,
            CopyTarget::Link => FeedbackKind::CopyLink,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = ClientArgs::parse();
    let store = SettingsStore::default_location();

    match run(args, &store).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: ClientArgs, store: &SettingsStore) -> Result<ExitCode, String> {
    let settings = store.load_or_default();
    let server_url = settings.resolve_server_url(args.server_url.as_deref());
    match args.command {
        ClientCommand::Upload { files, copy } => {
            let transport = HttpTransport::new(&server_url).map_err(|e| e.to_string())?;
            let saver = DirectorySaver::new(settings.resolve_download_dir(None));
            let controller = TransferController::new(transport, saver);
            upload(&controller, files, copy).await
        }
        ClientCommand::Download {
            pickup_key,
            output_dir,
        } => {
            let transport = HttpTransport::new(&server_url).map_err(|e| e.to_string())?;
            let dir = settings.resolve_download_dir(output_dir.as_deref());
            let controller = TransferController::new(transport, DirectorySaver::new(dir));
            download(&controller, &pickup_key).await
        }
        ClientCommand::Config {
            set_server_url,
            set_download_dir,
        } => configure(store, settings, set_server_url, set_download_dir),
    }
}

async fn upload(
    controller: &TransferController<HttpTransport>,
    files: Vec<PathBuf>,
    copy: Option<CopyTarget>,
) -> Result<ExitCode, String> {
    let mut drop_zone = DropZone::default();
    drop_zone.hover();
    let path = drop_zone
        .drop_files(files)
        .ok_or_else(|| "no file given".to_owned())?;

    let file = SelectedFile::from_path(&path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    if file.bytes.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }

    let renderer = tokio::spawn(render_upload_progress(controller.upload_updates()));
    let outcome = controller.start_upload(file).await;
    let _ = renderer.await;

    let Some(state) = outcome else {
        return Err("upload was superseded".to_owned());
    };
    if state.status != TransferStatus::Succeeded {
        eprintln!("{}", state.error_message.unwrap_or_default());
        return Ok(ExitCode::FAILURE);
    }

    let pickup_key = state.pickup_key.clone().unwrap_or_default();
    let link = state.share_link(controller.transport().endpoint());
    println!("Pickup key: {pickup_key}");
    if let Some(link) = &link {
        println!("Link: {link}");
    }

    if let Some(target) = copy {
        let text = match target {
            CopyTarget::Id => pickup_key,
            CopyTarget::Link => link.ok_or_else(|| {
                "the file has no extension, so there is no link to copy".to_owned()
            })?,
        };
        let kind = FeedbackKind::from(target);
        let sequencer = FeedbackSequencer::new(SystemClipboard);
        sequencer.copy(kind, &text).map_err(|e| e.to_string())?;
        eprintln!("Copied!");
        sequencer.wait_until_hidden(kind).await;
    }

    Ok(ExitCode::SUCCESS)
}

async fn render_upload_progress(mut updates: WatchStream<TransferState>) {
    let mut stderr = io::stderr();
    while let Some(state) = updates.next().await {
        match state.status {
            TransferStatus::Idle => {}
            TransferStatus::InProgress if state.progress_percent > 0 => {
                let _ = write!(stderr, "\rUploading... {:>3}%", state.progress_percent);
                let _ = stderr.flush();
            }
            TransferStatus::InProgress => {
                let _ = write!(stderr, "\rUploading...");
                let _ = stderr.flush();
            }
            TransferStatus::Succeeded | TransferStatus::Failed => {
                let _ = writeln!(stderr);
                break;
            }
        }
    }
}

async fn download(
    controller: &TransferController<HttpTransport>,
    pickup_key: &str,
) -> Result<ExitCode, String> {
    let state = controller
        .start_download(pickup_key)
        .await
        .ok_or_else(|| "download was superseded".to_owned())?;

    match (state.status, state.saved_to) {
        (TransferStatus::Succeeded, Some(path)) => {
            println!("Saved {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        (TransferStatus::Succeeded, None) => Err(format!(
            "retrieved {} but could not save it",
            state.file_name.unwrap_or_default()
        )),
        _ => {
            eprintln!("{}", state.error_message.unwrap_or_default());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn configure(
    store: &SettingsStore,
    mut settings: ClientSettings,
    server_url: Option<String>,
    download_dir: Option<PathBuf>,
) -> Result<ExitCode, String> {
    if server_url.is_none() && download_dir.is_none() {
        println!("settings file: {}", store.path().display());
        println!("server url:    {}", settings.resolve_server_url(None));
        println!("download dir:  {}", settings.resolve_download_dir(None).display());
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(url) = server_url {
        deaddrop_core::endpoint_url(&url).map_err(|e| e.to_string())?;
        settings.server_url = Some(url);
    }
    if let Some(dir) = download_dir {
        settings.download_dir = Some(dir);
    }

    store.save_with_retry(&settings).map_err(|e| e.to_string())?;
    debug!(path = %store.path().display(), "settings saved");
    println!("Saved {}", store.path().display());
    Ok(ExitCode::SUCCESS)
}
