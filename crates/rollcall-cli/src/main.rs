use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod script;

use script::{EnrollFrame, ScanFrame};

#[zbus::proxy(
    interface = "io.rollcall.Rollcall1",
    default_service = "io.rollcall.Rollcall1",
    default_path = "/io/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn create_identity(&self, display_name: &str, external_ref: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn rename_identity(&self, identity_id: &str, display_name: &str) -> zbus::Result<String>;
    async fn set_identity_attributes(&self, identity_id: &str, category: &str, rank: &str) -> zbus::Result<String>;
    async fn begin_enrollment(&self, identity_id: &str) -> zbus::Result<String>;
    async fn feed_enrollment_frame(
        &self,
        identity_id: &str,
        has_face: bool,
        pitch: f64,
        yaw: f64,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn cancel_enrollment(&self, identity_id: &str) -> zbus::Result<String>;
    async fn retry_finalize(&self, identity_id: &str) -> zbus::Result<String>;
    async fn enroll_from_photo(&self, identity_id: &str, image: &[u8]) -> zbus::Result<()>;
    async fn feed_scan_frame(&self, face_present: bool, image: &[u8]) -> zbus::Result<String>;
    async fn register_manual(
        &self,
        identity_id: &str,
        display_name: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn edit_display_name(&self, record_id: &str, new_name: &str, editor: &str) -> zbus::Result<String>;
    async fn list_records(&self, date: &str) -> zbus::Result<String>;
    async fn summary(&self, date: &str) -> zbus::Result<String>;
    async fn delete_record(&self, record_id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered identities
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Guided five-pose enrollment replayed from a frame script
    Enroll {
        identity_id: String,
        /// JSON list of {has_face, pitch, yaw, image}
        #[arg(long)]
        script: PathBuf,
        /// Delay between frames
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Cancel an in-progress enrollment
    EnrollCancel { identity_id: String },
    /// Retry saving a completed enrollment
    EnrollRetry { identity_id: String },
    /// Enroll an identity from a single photo
    EnrollPhoto { identity_id: String, photo: PathBuf },
    /// Enroll every identity without references from <dir>/<external_ref>.<jpg|jpeg|png>
    Backfill {
        #[arg(long)]
        photos: PathBuf,
    },
    /// Replay scan frames and print every state change
    Scan {
        /// JSON list of {face_present, image}
        #[arg(long)]
        script: PathBuf,
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
        /// Keep polling this long after the last frame for a settled result
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
    /// List attendance records
    Records {
        /// YYYY-MM-DD, today when omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// Show day totals
    Summary {
        #[arg(long)]
        date: Option<String>,
    },
    /// Register attendance manually; without --identity registers a visitor
    Register {
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Optional evidence image
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Correct the name on a visitor record
    EditName {
        record_id: String,
        new_name: String,
        /// Defaults to $USER
        #[arg(long)]
        editor: Option<String>,
    },
    /// Delete an attendance record
    Delete { record_id: String },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Register a person
    Add {
        #[arg(long)]
        name: String,
        /// Unique external reference, e.g. an ID card number
        #[arg(long = "ref")]
        external_ref: String,
    },
    /// List registered people
    List,
    /// Change a person's display name
    Rename { identity_id: String, name: String },
    /// Set a person's category and rank; an omitted value is cleared
    Set {
        identity_id: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        rank: Option<String>,
    },
}

fn parse(reply: &str) -> Result<Value> {
    serde_json::from_str(reply).context("daemon sent malformed JSON")
}

fn print_json(reply: &str) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&parse(reply)?)?);
    Ok(())
}

fn print_records(reply: &str) -> Result<()> {
    let records = parse(reply)?;
    let Some(records) = records.as_array() else {
        bail!("expected a list of records");
    };
    if records.is_empty() {
        println!("No records");
        return Ok(());
    }
    for r in records {
        let confidence = r["confidence"]
            .as_u64()
            .map(|c| format!("{c}%"))
            .unwrap_or_else(|| "-".to_string());
        let visitor = if r["is_visitor"].as_bool().unwrap_or(false) {
            " (visitor)"
        } else {
            ""
        };
        println!(
            "#{:<4} {}  {:<8} {:>5}  {}{}  [{}]",
            r["sequence"].as_u64().unwrap_or(0),
            r["timestamp"].as_str().unwrap_or("?"),
            r["mode"].as_str().unwrap_or("?"),
            confidence,
            r["display_name"].as_str().unwrap_or("?"),
            visitor,
            r["id"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn find_photo(dir: &Path, external_ref: &str) -> Option<PathBuf> {
    ["jpg", "jpeg", "png"]
        .iter()
        .map(|ext| dir.join(format!("{external_ref}.{ext}")))
        .find(|p| p.is_file())
}

async fn run_enroll(proxy: &RollcallProxy<'_>, identity_id: &str, script_path: &Path, interval: Duration) -> Result<()> {
    let frames: Vec<EnrollFrame> = script::load(script_path)?;
    print_json(&proxy.begin_enrollment(identity_id).await?)?;

    for (i, frame) in frames.iter().enumerate() {
        let image = script::read_image(frame.image.as_deref())?;
        let reply = proxy
            .feed_enrollment_frame(identity_id, frame.has_face, frame.pitch, frame.yaw, &image)
            .await;
        let feedback = match reply {
            Ok(r) => parse(&r)?,
            Err(e) => {
                eprintln!("frame {i}: {e}");
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        let kind = feedback["frame"].as_str().unwrap_or("?");
        match kind {
            "extracted" => {
                let report = &feedback["report"];
                let progress = &report["progress"];
                println!(
                    "frame {i}: {} ({}/{})",
                    if report["accepted"].as_bool().unwrap_or(false) { "captured" } else { "no face" },
                    progress["captured"],
                    progress["required"],
                );
                match report["saved"].as_bool() {
                    Some(true) => {
                        println!("Enrollment saved.");
                        return Ok(());
                    }
                    Some(false) => {
                        println!("All poses captured but not saved yet; run `rollcall enroll-retry {identity_id}`.");
                        return Ok(());
                    }
                    None => {}
                }
            }
            "wrong_pose" => println!("frame {i}: {}", feedback["prompt"].as_str().unwrap_or("adjust pose")),
            "cooling_down" => println!("frame {i}: hold still ({} ms)", feedback["remaining_ms"]),
            other => println!("frame {i}: {other}"),
        }
        tokio::time::sleep(interval).await;
    }

    println!("Script ended before every pose was captured; the session is still open.");
    Ok(())
}

async fn run_scan(proxy: &RollcallProxy<'_>, script_path: &Path, interval: Duration, wait: Duration) -> Result<()> {
    let frames: Vec<ScanFrame> = script::load(script_path)?;
    let mut last = String::new();

    let mut report = |reply: String| -> Result<()> {
        if reply != last {
            print_json(&reply)?;
            last = reply;
        }
        Ok(())
    };

    for frame in &frames {
        let image = script::read_image(frame.image.as_deref())?;
        report(proxy.feed_scan_frame(frame.face_present, &image).await?)?;
        tokio::time::sleep(interval).await;
    }

    // Let an outstanding recognition settle.
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        let status = parse(&proxy.status().await?)?;
        let scan = status["scan"].to_string();
        let settled = status["scan"]["state"] != "EVALUATING";
        report(scan)?;
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn).await?;

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::Add { name, external_ref } => {
                print_json(&proxy.create_identity(&name, &external_ref).await?)?;
            }
            IdentityAction::List => {
                let identities = parse(&proxy.list_identities().await?)?;
                let list = identities.as_array().cloned().unwrap_or_default();
                if list.is_empty() {
                    println!("No identities registered");
                }
                for i in list {
                    println!(
                        "{}  {:<24} ref={:<14} references={}  {} {}",
                        i["id"].as_str().unwrap_or("?"),
                        i["display_name"].as_str().unwrap_or("?"),
                        i["external_ref"].as_str().unwrap_or("?"),
                        i["references"],
                        i["category"].as_str().unwrap_or(""),
                        i["rank"].as_str().unwrap_or(""),
                    );
                }
            }
            IdentityAction::Rename { identity_id, name } => {
                print_json(&proxy.rename_identity(&identity_id, &name).await?)?;
            }
            IdentityAction::Set {
                identity_id,
                category,
                rank,
            } => {
                let reply = proxy
                    .set_identity_attributes(
                        &identity_id,
                        category.as_deref().unwrap_or(""),
                        rank.as_deref().unwrap_or(""),
                    )
                    .await?;
                print_json(&reply)?;
            }
        },
        Commands::Enroll {
            identity_id,
            script,
            interval_ms,
        } => {
            run_enroll(&proxy, &identity_id, &script, Duration::from_millis(interval_ms)).await?;
        }
        Commands::EnrollCancel { identity_id } => {
            print_json(&proxy.cancel_enrollment(&identity_id).await?)?;
        }
        Commands::EnrollRetry { identity_id } => {
            print_json(&proxy.retry_finalize(&identity_id).await?)?;
            println!("Enrollment saved.");
        }
        Commands::EnrollPhoto { identity_id, photo } => {
            let image = std::fs::read(&photo).with_context(|| format!("reading {}", photo.display()))?;
            proxy.enroll_from_photo(&identity_id, &image).await?;
            println!("Enrolled {identity_id} from {}", photo.display());
        }
        Commands::Backfill { photos } => {
            let identities = parse(&proxy.list_identities().await?)?;
            let (mut enrolled, mut skipped, mut failed) = (0usize, 0usize, 0usize);
            for i in identities.as_array().cloned().unwrap_or_default() {
                if i["references"].as_u64().unwrap_or(0) > 0 {
                    continue;
                }
                let id = i["id"].as_str().unwrap_or_default();
                let external_ref = i["external_ref"].as_str().unwrap_or_default();
                let Some(photo) = find_photo(&photos, external_ref) else {
                    println!("{external_ref}: no photo");
                    skipped += 1;
                    continue;
                };
                let image = std::fs::read(&photo).with_context(|| format!("reading {}", photo.display()))?;
                match proxy.enroll_from_photo(id, &image).await {
                    Ok(()) => {
                        println!("{external_ref}: enrolled");
                        enrolled += 1;
                    }
                    Err(e) => {
                        println!("{external_ref}: {e}");
                        failed += 1;
                    }
                }
            }
            println!("Backfill done: {enrolled} enrolled, {skipped} without photo, {failed} failed");
        }
        Commands::Scan {
            script,
            interval_ms,
            wait_ms,
        } => {
            run_scan(
                &proxy,
                &script,
                Duration::from_millis(interval_ms),
                Duration::from_millis(wait_ms),
            )
            .await?;
        }
        Commands::Records { date } => {
            print_records(&proxy.list_records(date.as_deref().unwrap_or("")).await?)?;
        }
        Commands::Summary { date } => {
            print_json(&proxy.summary(date.as_deref().unwrap_or("")).await?)?;
        }
        Commands::Register {
            identity,
            name,
            image,
        } => {
            let image = script::read_image(image.as_deref())?;
            let reply = proxy
                .register_manual(
                    identity.as_deref().unwrap_or(""),
                    name.as_deref().unwrap_or(""),
                    &image,
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::EditName {
            record_id,
            new_name,
            editor,
        } => {
            let editor = editor
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "operator".to_string());
            print_json(&proxy.edit_display_name(&record_id, &new_name, &editor).await?)?;
        }
        Commands::Delete { record_id } => {
            if proxy.delete_record(&record_id).await? {
                println!("Deleted {record_id}");
            } else {
                println!("No record {record_id}");
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}
