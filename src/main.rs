use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use homeface::{
    camera::{snapshot::{decode_data_uri, file_to_data_uri}, Camera},
    cli::capture_from_camera,
    common::{Config, DevMode},
    core::{FaceWorkflow, TokenManager},
    service::{client::unexpected, AgentClient, FaceService, HttpFaceService},
    service::protocol::{Request, Response},
    storage::FileCredentialStore,
};

#[derive(Parser)]
#[command(name = "homeface")]
#[command(about = "Face enrollment and verification against the hosted face service")]
struct Cli {
    /// Enable development mode (keeps data under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a token pair and store it for the agent
    Login,
    /// Clear the stored tokens
    Logout,
    /// List persons known to the service
    Persons,
    /// Add a person
    AddPerson {
        id: String,
        #[arg(short, long)]
        name: String,
    },
    /// Rename a person, optionally changing its id
    EditPerson {
        id: String,
        #[arg(long)]
        new_id: Option<String>,
        #[arg(short, long)]
        name: String,
    },
    /// Delete a person
    DeletePerson { id: String },
    /// Enroll a person from image files or the camera
    Enroll {
        person: String,
        #[command(flatten)]
        source: ImageSource,
    },
    /// Check images against one person or everybody
    Verify {
        #[arg(short, long)]
        person: Option<String>,
        #[command(flatten)]
        source: ImageSource,
    },
    /// Capture snapshots with the camera and save them as JPEG
    Capture {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List cameras and show which one auto-detection picks
    DetectCamera,
    /// Talk to a running agent
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(clap::Args)]
struct ImageSource {
    /// JPEG/PNG files to submit
    #[arg(short, long, num_args = 1..)]
    images: Vec<PathBuf>,
    /// Capture from the camera instead
    #[arg(long, conflicts_with = "images")]
    camera: bool,
    /// Disable the terminal preview while capturing
    #[arg(long)]
    no_preview: bool,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Push image files into the agent's buffer
    Ingest {
        #[arg(required_unless_present = "camera")]
        files: Vec<PathBuf>,
        /// Capture from the camera and push the snapshots
        #[arg(long)]
        camera: bool,
    },
    /// Verify the buffered images
    Verify {
        #[arg(short, long)]
        person: Option<String>,
    },
    /// Enroll the buffered images
    Enroll { person: String },
    /// Refresh the agent's person list
    Sync,
    Status,
    /// Discard buffered images
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config = load_config(cli.config.clone().unwrap_or_else(|| dev_mode.config_file()))?;

    match cli.command {
        Commands::DetectCamera => detect_camera()?,
        Commands::Capture { out } => {
            let images = capture_from_camera(&config, &dev_mode, true).await?;
            match out {
                // Dev mode already keeps every capture
                None if dev_mode.is_enabled() => {
                    println!("📸 {} snapshot(s) in {}", images.len(), dev_mode.captures_dir().display());
                }
                out => {
                    let dir = out.unwrap_or_else(|| dev_mode.captures_dir());
                    std::fs::create_dir_all(&dir)?;
                    for (i, image) in images.iter().enumerate() {
                        let path = dir.join(format!("capture_{}.jpg", i));
                        decode_data_uri(image)?.save(&path)?;
                        println!("📸 {}", path.display());
                    }
                }
            }
        }
        Commands::Agent { command } => run_agent_command(command, &config, &dev_mode).await?,
        command => {
            let app = App::start(&config, &dev_mode)?;
            let result = run_service_command(command, &app, &config, &dev_mode).await;
            app.shutdown();
            result?;
        }
    }

    Ok(())
}

/// Shared plumbing for commands that talk to the face service.
struct App {
    workflow: FaceWorkflow,
    cancel: CancellationToken,
}

impl App {
    fn start(config: &Config, dev_mode: &DevMode) -> Result<Self> {
        let service: Arc<dyn FaceService> = Arc::new(HttpFaceService::new(&config.service)?);
        let store = Arc::new(FileCredentialStore::new(dev_mode.credentials_file())?);
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&service),
            store.clone(),
            config.service.tokens_key.clone(),
            config.service.credentials(),
        ));

        // The agent may refresh while a camera session is running.
        let cancel = CancellationToken::new();
        store.spawn_poller(Duration::from_millis(config.service.store_poll_ms), cancel.clone());
        tokens.spawn_store_watch(cancel.clone());

        Ok(Self {
            workflow: FaceWorkflow::new(tokens, service, config.service.engine),
            cancel,
        })
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn run_service_command(command: Commands, app: &App, config: &Config, dev_mode: &DevMode) -> Result<()> {
    let workflow = &app.workflow;

    match command {
        Commands::Login => {
            if !workflow.tokens().has_credentials() {
                println!("⚠️  No login configured. Set [service] login/password or HOMEFACE_LOGIN/HOMEFACE_PASSWORD.");
            }
            workflow.tokens().ensure_valid_access_token().await?;
            match workflow.tokens().access_token_expiry().await {
                Some(exp) => println!("✅ Logged in, token valid until {}", format_epoch(exp)),
                None => println!("✅ Logged in"),
            }
        }
        Commands::Logout => {
            workflow.tokens().discard().await?;
            println!("Stored tokens cleared");
        }
        Commands::Persons => {
            let list = workflow.list_persons().await?;
            if list.persons.is_empty() {
                println!("No persons defined");
            }
            for person in &list.persons {
                let enrolled = if person.is_enrolled(workflow.engine()) { "enrolled" } else { "not enrolled" };
                println!("{:<16} {:<24} {}", person.id, person.name, enrolled);
            }
            if let Some(stats) = &list.stats {
                println!();
                for line in stats.summary_lines() {
                    println!("{}", line);
                }
            }
        }
        Commands::AddPerson { id, name } => {
            let count = workflow.add_person(&id, &name).await?;
            println!("✅ Added {} ({} persons)", id, count);
        }
        Commands::EditPerson { id, new_id, name } => {
            let new_id = new_id.unwrap_or_else(|| id.clone());
            let count = workflow.edit_person(&id, &new_id, &name).await?;
            println!("✅ Updated {} ({} persons)", new_id, count);
        }
        Commands::DeletePerson { id } => {
            let count = workflow.delete_person(&id).await?;
            println!("✅ Deleted {} ({} persons left)", id, count);
        }
        Commands::Enroll { person, source } => {
            let images = collect_images(&source, config, dev_mode).await?;
            let report = workflow.enroll(&person, &images).await?;
            if report.enrolled {
                println!("✅ {}", report.summary());
            } else {
                println!("❌ {}", report.summary());
            }
            if let Some(stats) = &report.stats {
                for line in stats.summary_lines() {
                    println!("   {}", line);
                }
            }
        }
        Commands::Verify { person, source } => {
            let images = collect_images(&source, config, dev_mode).await?;
            let report = workflow.verify(person.as_deref(), &images).await?;
            let mark = if report.matched().is_some() { "✅" } else { "❌" };
            println!("{} {}", mark, report.summary());
        }
        Commands::Capture { .. } | Commands::DetectCamera | Commands::Agent { .. } => {}
    }

    Ok(())
}

async fn collect_images(source: &ImageSource, config: &Config, dev_mode: &DevMode) -> Result<Vec<String>> {
    if source.camera {
        return Ok(capture_from_camera(config, dev_mode, !source.no_preview).await?);
    }
    if source.images.is_empty() {
        anyhow::bail!("Pass --images <FILE>... or --camera");
    }
    read_image_files(&source.images, config.camera.jpeg_quality)
}

fn read_image_files(paths: &[PathBuf], quality: u8) -> Result<Vec<String>> {
    paths
        .iter()
        .map(|path| {
            file_to_data_uri(path, quality)
                .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))
        })
        .collect()
}

async fn run_agent_command(command: AgentCommands, config: &Config, dev_mode: &DevMode) -> Result<()> {
    let client = AgentClient::new(dev_mode.agent_socket(), dev_mode.is_enabled());

    match command {
        AgentCommands::Ingest { files, camera } => {
            let images = if camera {
                capture_from_camera(config, dev_mode, true).await?
            } else {
                read_image_files(&files, config.camera.jpeg_quality)?
            };
            let count = client.ingest_all(images).await?;
            println!("Agent buffer holds {} image(s)", count);
        }
        AgentCommands::Verify { person } => match client.request(&Request::Verify { person }).await? {
            Response::Verified(verified) => {
                let mark = if verified.matched.is_some() { "✅" } else { "❌" };
                println!("{} {}", mark, verified.message);
            }
            other => return Err(unexpected(&other).into()),
        },
        AgentCommands::Enroll { person } => match client.request(&Request::Enroll { person }).await? {
            Response::Enrolled(enrolled) => {
                let mark = if enrolled.enrolled { "✅" } else { "❌" };
                println!("{} {}", mark, enrolled.message);
            }
            other => return Err(unexpected(&other).into()),
        },
        AgentCommands::Sync => match client.request(&Request::Sync).await? {
            Response::Synced(synced) => {
                println!("{} person(s)", synced.persons);
                for id in &synced.added {
                    println!("  + {}", id);
                }
                for id in &synced.renamed {
                    println!("  ~ {}", id);
                }
                for id in &synced.removed {
                    println!("  - {}", id);
                }
            }
            other => return Err(unexpected(&other).into()),
        },
        AgentCommands::Status => match client.request(&Request::Status).await? {
            Response::Status(status) => {
                println!("Buffer: {}/{}", status.buffered, status.capacity);
                println!(
                    "Credentials: {}",
                    if status.credentials_configured { "configured" } else { "missing" }
                );
                match status.token_expires_at {
                    Some(exp) => println!("Token valid until {}", format_epoch(exp)),
                    None => println!("No token"),
                }
                for person in &status.persons {
                    let seen = if person.detected { "detected" } else { "" };
                    println!("  {:<16} {:<24} {}", person.id, person.name, seen);
                }
            }
            other => return Err(unexpected(&other).into()),
        },
        AgentCommands::Clear => match client.request(&Request::Clear).await? {
            Response::Cleared => println!("Agent buffer cleared"),
            other => return Err(unexpected(&other).into()),
        },
    }

    Ok(())
}

fn detect_camera() -> Result<()> {
    println!("🔍 Detecting available cameras...\n");

    let cameras = Camera::list_all_cameras()?;
    if cameras.is_empty() {
        println!("❌ No cameras found!");
        println!("\nTroubleshooting:");
        println!("  1. Check if cameras are connected");
        println!("  2. Ensure you have permission to access /dev/video*");
        return Ok(());
    }

    for camera in &cameras {
        println!("📷 /dev/video{}: {}", camera.index, camera.name);
        println!("   formats: {}", camera.formats.join(", "));
        if !camera.can_capture {
            println!("   (no video capture)");
        }
        println!();
    }

    println!("═══════════════════════════════════════════════════════");
    let selected = Camera::detect_camera()?;
    println!("✅ Auto-detected camera: /dev/video{}", selected);
    println!("\nThis will be used when device_index = 999 (auto-detect)");
    println!("\n📝 To pin a camera, set in the configuration:");
    println!("   [camera]");
    println!("   device_index = <NUMBER>");
    Ok(())
}

fn load_config(path: PathBuf) -> Result<Config> {
    if path.exists() {
        return Ok(Config::load_from_path(&path)?);
    }

    tracing::info!("No config at {}, using defaults", path.display());
    let mut config = Config::default();
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn setup_logging(dev_mode: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if dev_mode { "debug" } else { "warn" })
    });

    if dev_mode {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
