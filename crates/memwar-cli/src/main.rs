use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memwar_core::{Contact, ContactDraft, ContactPatch, Sighting};
use std::io::{self, BufRead, Write};

mod snap;

#[zbus::proxy(
    interface = "org.memwar.Memwar1",
    default_service = "org.memwar.Memwar1",
    default_path = "/org/memwar/Memwar1"
)]
trait Memwar {
    async fn list_contacts(&self) -> zbus::Result<String>;
    async fn recent_contacts(&self, n: u32) -> zbus::Result<String>;
    async fn search_contacts(&self, query: &str) -> zbus::Result<String>;
    async fn get_contact(&self, id: &str) -> zbus::Result<String>;
    async fn create_contact(&self, draft: &str) -> zbus::Result<String>;
    async fn update_contact(&self, id: &str, patch: &str) -> zbus::Result<String>;
    async fn delete_contact(&self, id: &str) -> zbus::Result<String>;
    async fn record_sighting(&self, id: &str, location: &str) -> zbus::Result<String>;
    async fn sightings(&self, id: &str) -> zbus::Result<String>;
    async fn start_session(&self) -> zbus::Result<String>;
    async fn capture(&self) -> zbus::Result<String>;
    async fn capture_unassisted(&self) -> zbus::Result<String>;
    async fn remembered(&self, id: &str) -> zbus::Result<String>;
    async fn forgotten(&self) -> zbus::Result<String>;
    async fn add_new(&self) -> zbus::Result<String>;
    async fn save(&self, location: &str) -> zbus::Result<String>;
    async fn discard(&self) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<String>;
    async fn session_state(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "memwar", about = "Remember the people around you")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every contact
    List,
    /// Show the most recently seen contacts
    Recent {
        /// How many contacts to show
        #[arg(short, default_value_t = memwar_core::RECENT_LIMIT as u32)]
        n: u32,
    },
    /// Find contacts by name or relationship
    Search { query: String },
    /// Show one contact in full
    Show { id: String },
    /// Add a contact
    Add {
        name: String,
        /// e.g. "Daughter", "Neighbor"
        relationship: String,
        #[arg(long)]
        avatar: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Phone number or other way to reach them
        #[arg(long)]
        contact: Option<String>,
    },
    /// Change fields of a contact
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        relationship: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        contact: Option<String>,
    },
    /// Remove a contact
    Remove { id: String },
    /// Record that you just saw someone
    Seen {
        id: String,
        #[arg(short, long)]
        location: Option<String>,
    },
    /// Show the sighting log, optionally for one contact
    History { id: Option<String> },
    /// Take a photo and find out who it is
    Snap {
        /// Where you are, recorded with the sighting
        #[arg(short, long)]
        location: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics
    Test {
        /// Device to test (default: first capture device found)
        #[arg(short, long)]
        device: Option<String>,
        /// Where to write the test still
        #[arg(short, long, default_value = "memwar-test.jpg")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Diagnostics talk to the camera directly so they work without the daemon.
    if let Commands::Test { device, output } = &cli.command {
        return camera_test(device.as_deref(), output);
    }

    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the session bus")?;
    let proxy = MemwarProxy::new(&conn)
        .await
        .context("memward is not running")?;

    match cli.command {
        Commands::List => {
            let contacts: Vec<Contact> = parse(&proxy.list_contacts().await?)?;
            print_contacts(&contacts);
        }
        Commands::Recent { n } => {
            let contacts: Vec<Contact> = parse(&proxy.recent_contacts(n).await?)?;
            print_contacts(&contacts);
        }
        Commands::Search { query } => {
            let contacts: Vec<Contact> = parse(&proxy.search_contacts(&query).await?)?;
            if contacts.is_empty() {
                println!("No contacts match \"{query}\"");
            }
            print_contacts(&contacts);
        }
        Commands::Show { id } => {
            let contact: Contact = parse(&proxy.get_contact(&id).await?)?;
            print_contact(&contact);
        }
        Commands::Add {
            name,
            relationship,
            avatar,
            location,
            notes,
            contact,
        } => {
            let draft = ContactDraft {
                avatar,
                location,
                notes,
                contact,
                ..ContactDraft::new(name, relationship)
            };
            let created: Contact = parse(&proxy.create_contact(&serde_json::to_string(&draft)?).await?)?;
            println!("Added {} ({})", created.name, created.id);
        }
        Commands::Edit {
            id,
            name,
            relationship,
            avatar,
            location,
            notes,
            contact,
        } => {
            let patch = ContactPatch {
                name,
                relationship,
                avatar,
                location,
                notes,
                contact,
                ..Default::default()
            };
            let updated: Contact = parse(&proxy.update_contact(&id, &serde_json::to_string(&patch)?).await?)?;
            print_contact(&updated);
        }
        Commands::Remove { id } => {
            let removed: Contact = parse(&proxy.delete_contact(&id).await?)?;
            println!("Removed {}", removed.name);
        }
        Commands::Seen { id, location } => {
            let contact: Contact = parse(
                &proxy
                    .record_sighting(&id, location.as_deref().unwrap_or_default())
                    .await?,
            )?;
            println!("{}: last seen {}", contact.name, contact.last_seen.unwrap_or_default());
        }
        Commands::History { id } => {
            let log: Vec<Sighting> = parse(&proxy.sightings(id.as_deref().unwrap_or_default()).await?)?;
            if log.is_empty() {
                println!("No sightings recorded");
            }
            for s in &log {
                println!("{}", sighting_line(s));
            }
        }
        Commands::Snap { location } => {
            snap::run(&proxy, location.as_deref()).await?;
        }
        Commands::Status => {
            let status: serde_json::Value = parse(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

fn camera_test(device: Option<&str>, output: &str) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = memwar_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let path = match device {
        Some(p) => p.to_string(),
        None => match devices.first() {
            Some(d) => d.path.clone(),
            None => bail!("nothing to test"),
        },
    };

    tracing::debug!(device = %path, "opening camera for diagnostics");
    let camera = memwar_hw::Camera::open(&path)?;
    println!("Opened {} at {}x{}", camera.device_path, camera.width, camera.height);
    camera.warm_up(4)?;
    let jpeg = camera.snap_jpeg(6, 85)?;
    std::fs::write(output, &jpeg).with_context(|| format!("writing {output}"))?;
    println!("Wrote {} bytes to {output}", jpeg.len());
    Ok(())
}

pub(crate) fn parse<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("unexpected reply from memward: {raw}"))
}

/// Read one trimmed line from stdin after printing `question`.
pub(crate) fn ask(question: &str) -> Result<String> {
    print!("{question} ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("input closed");
    }
    Ok(line.trim().to_string())
}

fn print_contacts(contacts: &[Contact]) {
    for c in contacts {
        println!("{}", contact_line(c));
    }
}

fn contact_line(c: &Contact) -> String {
    match &c.last_seen {
        Some(seen) => format!("{:>8}  {} ({}), last seen {seen}", short_id(&c.id), c.name, c.relationship),
        None => format!("{:>8}  {} ({})", short_id(&c.id), c.name, c.relationship),
    }
}

fn print_contact(c: &Contact) {
    println!("{}", c.name);
    println!("  id:           {}", c.id);
    println!("  relationship: {}", c.relationship);
    println!("  avatar:       {}", c.avatar);
    if let Some(v) = &c.last_seen {
        println!("  last seen:    {v}");
    }
    if let Some(v) = &c.location {
        println!("  location:     {v}");
    }
    if let Some(v) = &c.contact {
        println!("  contact:      {v}");
    }
    if let Some(v) = &c.notes {
        println!("  notes:        {v}");
    }
}

fn sighting_line(s: &Sighting) -> String {
    let when = s.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M");
    match &s.location {
        Some(place) => format!("{when}  {} ({}) at {place}", s.name, s.relationship),
        None => format!("{when}  {} ({})", s.name, s.relationship),
    }
}

/// Uuids are long; the seeded contacts use short numeric ids.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact(id: &str, last_seen: Option<&str>) -> Contact {
        Contact {
            id: id.into(),
            name: "Sarah J".into(),
            relationship: "Daughter".into(),
            avatar: memwar_core::types::PLACEHOLDER_AVATAR.into(),
            last_seen: last_seen.map(str::to_string),
            location: None,
            notes: None,
            contact: None,
        }
    }

    #[test]
    fn test_contact_line() {
        assert_eq!(
            contact_line(&contact("2", Some("5pm • Peet's Cafe"))),
            "       2  Sarah J (Daughter), last seen 5pm • Peet's Cafe"
        );
        let line = contact_line(&contact("0b7c2a9e-1111-4222-8333-444455556666", None));
        assert_eq!(line, "0b7c2a9e  Sarah J (Daughter)");
    }

    #[test]
    fn test_sighting_line_without_location() {
        let s = Sighting {
            contact_id: "2".into(),
            name: "Sarah J".into(),
            relationship: "Daughter".into(),
            avatar: memwar_core::types::PLACEHOLDER_AVATAR.into(),
            phone: None,
            location: None,
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            image_ref: None,
        };
        assert!(sighting_line(&s).ends_with("  Sarah J (Daughter)"));
    }

    #[test]
    fn test_parse_reports_raw_reply() {
        let err = parse::<Vec<Contact>>("not json").unwrap_err();
        assert!(err.to_string().contains("not json"));
    }

    #[test]
    fn test_cli_parses_snap_location() {
        let cli = Cli::try_parse_from(["memwar", "snap", "--location", "Park"]).unwrap();
        assert!(matches!(cli.command, Commands::Snap { location: Some(ref l) } if l == "Park"));
    }
}
