use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Monitor1",
    default_service = "org.rollcall.Monitor1",
    default_path = "/org/rollcall/Monitor1"
)]
trait Monitor {
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_gallery(&self) -> zbus::Result<String>;
    async fn set_frame_skip(&self, every: u32) -> zbus::Result<u32>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn add_identity(
        &self,
        display_name: &str,
        code: &str,
        section: &str,
        age: u32,
    ) -> zbus::Result<(i64, String)>;
    async fn update_identity(
        &self,
        identity_id: i64,
        display_name: &str,
        code: &str,
        section: &str,
        age: u32,
    ) -> zbus::Result<bool>;
    async fn find_identity(&self, code: &str) -> zbus::Result<String>;
    async fn add_signature(&self, identity_id: i64, signature: &[f64]) -> zbus::Result<i64>;
    async fn deactivate_identity(&self, identity_id: i64) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn attendance(&self, date: &str) -> zbus::Result<String>;
    async fn mark_attendance(&self, identity_id: i64, status: &str, date: &str) -> zbus::Result<()>;
    async fn summary(&self) -> zbus::Result<String>;
    async fn export_roster(&self) -> zbus::Result<String>;
    async fn get_schedule(&self) -> zbus::Result<String>;
    async fn set_schedule(&self, entry_time: &str, tolerance_minutes: u32) -> zbus::Result<()>;
    async fn clear_schedule(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show monitoring status
    Status,
    /// Reload the gallery after enrollment changes
    Reload,
    /// Process every Nth frame
    FrameSkip { every: u32 },
    /// Stop the monitoring session
    Stop,
    /// Enroll a new identity
    Enroll {
        /// Display name (e.g. "Ana Torres")
        name: String,
        /// Roster code (default: next free number)
        #[arg(short, long)]
        code: Option<String>,
        #[arg(short, long)]
        section: Option<String>,
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        age: Option<u32>,
    },
    /// Edit an identity's roster fields
    Edit {
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        code: Option<String>,
        #[arg(short, long)]
        section: Option<String>,
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        age: Option<u32>,
    },
    /// Look up an active identity by roster code
    Find { code: String },
    /// Add a signature to an identity from a JSON array of numbers ("-" for stdin)
    AddSignature { id: i64, file: PathBuf },
    /// Exclude an identity from recognition
    Deactivate { id: i64 },
    /// List enrolled identities
    Identities,
    /// Show attendance for a day
    Attendance {
        /// YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Mark attendance manually
    Mark {
        id: i64,
        #[arg(value_parser = ["present", "late", "absent"])]
        status: String,
        /// YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show today's attendance summary
    Summary,
    /// Export the roster as CSV
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show or change the class schedule
    Schedule {
        #[command(subcommand)]
        action: Option<ScheduleAction>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last frame as an image
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    Show,
    /// Set entry time (HH:MM) and tolerance
    Set {
        entry_time: String,
        #[arg(short, long, default_value_t = 15)]
        tolerance: u32,
    },
    /// Remove the schedule; every arrival counts as present
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test {
            device,
            frames,
            save,
        } => camera_test(&device, frames, save),
        command => {
            tracing::debug!(service = "org.rollcall.Monitor1", "connecting to rollcalld");
            let conn = zbus::Connection::session()
                .await
                .context("connecting to the session bus")?;
            let proxy = MonitorProxy::new(&conn)
                .await
                .context("rollcalld is not running")?;
            run_remote(&proxy, command).await
        }
    }
}

async fn run_remote(proxy: &MonitorProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Reload => {
            let stats: Value = serde_json::from_str(&proxy.reload_gallery().await?)?;
            println!(
                "gallery reloaded: {} signatures, {} identities",
                stats["signatures"], stats["identities"]
            );
        }
        Commands::FrameSkip { every } => {
            let every = proxy.set_frame_skip(every).await?;
            println!("processing every {every} frame(s)");
        }
        Commands::Stop => {
            proxy.stop().await?;
            println!("monitoring stopped");
        }
        Commands::Enroll {
            name,
            code,
            section,
            age,
        } => {
            let (id, code) = proxy
                .add_identity(
                    &name,
                    code.as_deref().unwrap_or_default(),
                    section.as_deref().unwrap_or_default(),
                    age.unwrap_or_default(),
                )
                .await?;
            println!("enrolled {name} as identity {id} with code {code}");
        }
        Commands::Edit {
            id,
            name,
            code,
            section,
            age,
        } => {
            if name.is_none() && code.is_none() && section.is_none() && age.is_none() {
                bail!("nothing to change; pass --name, --code, --section or --age");
            }
            let updated = proxy
                .update_identity(
                    id,
                    name.as_deref().unwrap_or_default(),
                    code.as_deref().unwrap_or_default(),
                    section.as_deref().unwrap_or_default(),
                    age.unwrap_or_default(),
                )
                .await?;
            if !updated {
                bail!("no identity with id {id}");
            }
            println!("identity {id} updated");
        }
        Commands::Find { code } => {
            let found: Value = serde_json::from_str(&proxy.find_identity(&code).await?)?;
            if found.is_null() {
                bail!("no active identity with code {code}");
            }
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Commands::AddSignature { id, file } => {
            let signature = read_signature(&file)?;
            let sig_id = proxy.add_signature(id, &signature).await?;
            println!(
                "stored signature {sig_id} ({} values) for identity {id}; run `rollcall reload` to apply",
                signature.len()
            );
        }
        Commands::Deactivate { id } => {
            if proxy.deactivate_identity(id).await? {
                println!("identity {id} deactivated");
            } else {
                bail!("no identity with id {id}");
            }
        }
        Commands::Identities => {
            let rows: Vec<Value> = serde_json::from_str(&proxy.list_identities().await?)?;
            if rows.is_empty() {
                println!("No identities enrolled");
            }
            for row in rows {
                println!(
                    "{:>5}  {:<8} {:<30} {:<6} {:>3} signature(s){}",
                    row["id"].as_i64().unwrap_or_default(),
                    row["code"].as_str().unwrap_or_default(),
                    row["display_name"].as_str().unwrap_or_default(),
                    row["section"].as_str().unwrap_or("-"),
                    row["signatures"].as_u64().unwrap_or_default(),
                    if row["active"].as_bool() == Some(false) { "  [inactive]" } else { "" }
                );
            }
        }
        Commands::Attendance { date } => {
            let json = proxy.attendance(date.as_deref().unwrap_or_default()).await?;
            print!("{}", render_attendance(&json)?);
        }
        Commands::Mark { id, status, date } => {
            let date = date.unwrap_or_default();
            proxy.mark_attendance(id, &status, &date).await?;
            if date.is_empty() {
                println!("identity {id} marked {status}");
            } else {
                println!("identity {id} marked {status} on {date}");
            }
        }
        Commands::Summary => print!("{}", render_summary(&proxy.summary().await?)?),
        Commands::Export { output } => {
            let csv = proxy.export_roster().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("roster written to {}", path.display());
                }
                None => print!("{csv}"),
            }
        }
        Commands::Schedule { action } => match action.unwrap_or(ScheduleAction::Show) {
            ScheduleAction::Show => {
                let schedule: Value = serde_json::from_str(&proxy.get_schedule().await?)?;
                if schedule.is_null() {
                    println!("no schedule set; every arrival counts as present");
                } else {
                    println!(
                        "entry {} with {} minute(s) tolerance",
                        schedule["entry_time"].as_str().unwrap_or_default(),
                        schedule["tolerance_minutes"]
                    );
                }
            }
            ScheduleAction::Set {
                entry_time,
                tolerance,
            } => {
                proxy.set_schedule(&entry_time, tolerance).await?;
                println!("schedule set to {entry_time} + {tolerance} min");
            }
            ScheduleAction::Clear => {
                proxy.clear_schedule().await?;
                println!("schedule cleared; every arrival counts as present");
            }
        },
        Commands::Devices | Commands::Test { .. } => bail!("command does not use the daemon"),
    }
    Ok(())
}

fn print_json(json: &str) -> Result<()> {
    let value: Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn read_signature(path: &Path) -> Result<Vec<f64>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    parse_signature(&text)
}

fn parse_signature(text: &str) -> Result<Vec<f64>> {
    let values: Vec<f64> = serde_json::from_str(text).context("signature must be a JSON array of numbers")?;
    if values.is_empty() {
        bail!("signature is empty");
    }
    Ok(values)
}

fn render_attendance(json: &str) -> Result<String> {
    let rows: Vec<Value> = serde_json::from_str(json)?;
    if rows.is_empty() {
        return Ok("No attendance recorded\n".to_string());
    }
    let mut out = format!("{:<10} {:<30} {:<8} {:<7} {}\n", "TIME", "NAME", "STATUS", "METHOD", "CONF");
    for row in &rows {
        out.push_str(&format!(
            "{:<10} {:<30} {:<8} {:<7} {:.2}\n",
            row["time"].as_str().unwrap_or_default(),
            row["display_name"].as_str().unwrap_or_default(),
            row["status"].as_str().unwrap_or_default(),
            row["method"].as_str().unwrap_or_default(),
            row["confidence"].as_f64().unwrap_or_default(),
        ));
    }
    Ok(out)
}

fn render_summary(json: &str) -> Result<String> {
    let summary: Value = serde_json::from_str(json)?;
    let mut out = format!(
        "{}: {} of {} present ({:.1}%), {} with signatures\n",
        summary["date"].as_str().unwrap_or_default(),
        summary["attendees"],
        summary["total_identities"],
        summary["attendance_rate"].as_f64().unwrap_or_default(),
        summary["with_signatures"],
    );
    out.push_str("\nLast 7 days:\n");
    for day in summary["daily"].as_array().into_iter().flatten() {
        out.push_str(&format!(
            "  {}  {}\n",
            day["date"].as_str().unwrap_or_default(),
            day["attendees"]
        ));
    }
    let statuses = summary["by_status"].as_array().into_iter().flatten();
    let statuses: Vec<String> = statuses
        .map(|s| format!("{} {}", s["status"].as_str().unwrap_or_default(), s["count"]))
        .collect();
    if !statuses.is_empty() {
        out.push_str(&format!("\nAll time: {}\n", statuses.join(", ")));
    }
    Ok(out)
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    tracing::debug!(count = devices.len(), "scanned V4L2 devices");
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
    Ok(())
}

fn camera_test(device: &str, frames: usize, save: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, 640, 480)?;
    println!(
        "opened {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );
    camera.warmup(4);

    let mut last = None;
    for i in 0..frames.max(1) {
        let frame = camera.capture_frame()?;
        tracing::debug!(sequence = frame.sequence, bytes = frame.data.len(), "frame captured");
        println!(
            "frame {i}: seq={} brightness={:.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { " (dark)" } else { "" }
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (save, last) {
        let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame size does not match its dimensions")?;
        img.save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        tracing::info!(path = %path.display(), "snapshot saved");
        println!("saved {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        assert_eq!(parse_signature("[0.5, -1, 2e-3]").unwrap(), vec![0.5, -1.0, 0.002]);
        assert!(parse_signature("[]").is_err());
        assert!(parse_signature("{\"a\":1}").is_err());
    }

    #[test]
    fn test_render_attendance() {
        let json = r#"[{"display_name":"Ana Torres","identity":3,"date":"2024-03-11",
            "time":"08:03:12","method":"face","status":"present","confidence":0.9123}]"#;
        let out = render_attendance(json).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("TIME"));
        assert!(lines[1].contains("Ana Torres"));
        assert!(lines[1].contains("present"));
        assert!(lines[1].ends_with("0.91"));
    }

    #[test]
    fn test_render_empty_attendance() {
        assert_eq!(render_attendance("[]").unwrap(), "No attendance recorded\n");
    }

    #[test]
    fn test_cli_parses_schedule_set() {
        let cli = Cli::try_parse_from(["rollcall", "schedule", "set", "07:30", "-t", "10"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Schedule {
                action: Some(ScheduleAction::Set { tolerance: 10, .. })
            }
        ));
        assert!(Cli::try_parse_from(["rollcall", "mark", "3", "sleepy"]).is_err());
    }

    #[test]
    fn test_render_summary() {
        let json = r#"{"date":"2024-03-11","total_identities":4,"with_signatures":3,
            "attendees":3,"attendance_rate":75.0,
            "daily":[{"date":"2024-03-10","attendees":0},{"date":"2024-03-11","attendees":3}],
            "by_status":[{"status":"late","count":1},{"status":"present","count":5}]}"#;
        let out = render_summary(json).unwrap();
        assert!(out.starts_with("2024-03-11: 3 of 4 present (75.0%), 3 with signatures\n"));
        assert!(out.contains("  2024-03-11  3\n"));
        assert!(out.ends_with("All time: late 1, present 5\n"));
    }

    #[test]
    fn test_cli_parses_roster_commands() {
        let cli = Cli::try_parse_from(["rollcall", "enroll", "Ana Torres", "-s", "3B", "--age", "15"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Enroll { code: None, age: Some(15), .. }
        ));
        assert!(Cli::try_parse_from(["rollcall", "enroll", "Ana", "--age", "0"]).is_err());

        let cli = Cli::try_parse_from(["rollcall", "mark", "3", "late", "-d", "2024-03-08"]).unwrap();
        assert!(matches!(cli.command, Commands::Mark { date: Some(_), .. }));

        let cli = Cli::try_parse_from(["rollcall", "schedule", "clear"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Schedule { action: Some(ScheduleAction::Clear) }
        ));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_device_scan_is_logged() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || sink.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || list_devices().unwrap());

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("scanned V4L2 devices"));
    }
}
