//! Interactive recognition session driven through memward.

use crate::{ask, parse, MemwarProxy};
use anyhow::Result;
use memwar_core::{Contact, ContactDraft};
use serde_json::Value;
use std::future::Future;

/// What the user picked at a prompt.
#[derive(Debug, PartialEq, Eq)]
enum Choice {
    Save,
    Retake,
    Yes(String),
    No,
    AddNew,
    Quit,
}

fn parse_choice(state: &str, input: &str) -> Option<Choice> {
    let mut words = input.split_whitespace();
    let word = words.next()?.to_lowercase();
    let rest = words.collect::<Vec<_>>().join(" ");
    let choice = match (state, word.as_str()) {
        (_, "q" | "quit") => Choice::Quit,
        ("recognized", "s" | "save") => Choice::Save,
        ("recognized" | "unrecognized" | "not_remembered", "r" | "retake" | "discard") => Choice::Retake,
        ("not_remembered", "y" | "yes") if !rest.is_empty() => Choice::Yes(rest),
        ("not_remembered", "n" | "no") => Choice::No,
        ("unrecognized" | "not_remembered", "a" | "add") => Choice::AddNew,
        _ => return None,
    };
    Some(choice)
}

fn prompt_for(state: &str) -> &'static str {
    match state {
        "recognized" => "[s]ave, [r]etake or [q]uit?",
        "unrecognized" => "[a]dd new, [r]etake or [q]uit?",
        _ => "[y]es <id>, [n]o, [a]dd new, [r]etake or [q]uit?",
    }
}

/// Drive one session, then cancel it whichever way the driver returned so
/// the daemon releases the camera.
pub async fn run(proxy: &MemwarProxy<'_>, location: Option<&str>) -> Result<()> {
    let outcome = drive(proxy, location).await;
    release(outcome, proxy.cancel()).await
}

/// Await `cancel` and hand back `outcome`. A failed cancel is only logged.
async fn release<F>(outcome: Result<()>, cancel: F) -> Result<()>
where
    F: Future<Output = zbus::Result<String>>,
{
    match cancel.await {
        Ok(reply) => tracing::debug!(%reply, "session closed"),
        Err(e) => tracing::warn!(error = %e, "could not cancel session"),
    }
    outcome
}

async fn drive(proxy: &MemwarProxy<'_>, location: Option<&str>) -> Result<()> {
    let mut reply: Value = parse(&proxy.start_session().await?)?;
    println!("Camera ready. Press enter to take a photo (or type 'self' to say who it is yourself).");

    loop {
        let state = reply["state"].as_str().unwrap_or("idle").to_string();
        match state.as_str() {
            "capturing" => {
                let input = ask(">")?;
                let result = match input.as_str() {
                    "q" | "quit" => proxy.cancel().await,
                    "self" => proxy.capture_unassisted().await,
                    _ => proxy.capture().await,
                };
                match result {
                    Ok(raw) => reply = parse(&raw)?,
                    // The session stays in capturing; let the user try again.
                    Err(e) => {
                        tracing::debug!(error = %e, "capture call failed");
                        println!("Capture failed: {e}");
                    }
                }
                continue;
            }
            "ended" => {
                report_end(&reply);
                return Ok(());
            }
            "idle" => return Ok(()),
            _ => {}
        }

        if let Some(err) = reply["error"].as_str() {
            println!("Recognition unavailable: {err}");
        }
        if let Some(text) = reply["display"].as_str() {
            println!("{text}");
        }
        if let Some(name) = reply["candidate"]["name"].as_str() {
            println!("This is {name}.");
        }

        let input = ask(prompt_for(&state))?;
        let Some(choice) = parse_choice(&state, &input) else {
            println!("Not an option here.");
            continue;
        };

        reply = match choice {
            Choice::Save => {
                let contact: Contact = parse(&proxy.save(location.unwrap_or_default()).await?)?;
                println!("Saved: {} last seen {}", contact.name, contact.last_seen.unwrap_or_default());
                return Ok(());
            }
            Choice::Retake => parse(&proxy.discard().await?)?,
            Choice::Yes(id) => match proxy.remembered(&id).await {
                Ok(raw) => parse(&raw)?,
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            },
            Choice::No => parse(&proxy.forgotten().await?)?,
            Choice::AddNew => {
                let avatar = proxy.add_new().await?;
                return add_contact(proxy, avatar, location).await;
            }
            Choice::Quit => parse(&proxy.cancel().await?)?,
        };
    }
}

async fn add_contact(proxy: &MemwarProxy<'_>, avatar: String, location: Option<&str>) -> Result<()> {
    let name = ask("Name:")?;
    let relationship = ask("Relationship:")?;
    let draft = ContactDraft {
        avatar: (!avatar.is_empty()).then_some(avatar),
        location: location.map(str::to_string),
        ..ContactDraft::new(name, relationship)
    };
    match proxy.create_contact(&serde_json::to_string(&draft)?).await {
        Ok(raw) => {
            let contact: Contact = parse(&raw)?;
            println!("Added {} ({})", contact.name, contact.id);
        }
        Err(e) => println!("Contact not added: {e}"),
    }
    Ok(())
}

fn report_end(reply: &Value) {
    match reply["disposition"]["kind"].as_str() {
        Some("forgotten") => println!("Nothing recorded."),
        Some("cancelled") => println!("Cancelled."),
        Some("aborted") => println!(
            "Session aborted: {}",
            reply["disposition"]["reason"].as_str().unwrap_or("unknown reason")
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_choices_depend_on_state() {
        assert_eq!(parse_choice("recognized", "s"), Some(Choice::Save));
        assert_eq!(parse_choice("unrecognized", "save"), None);
        assert_eq!(parse_choice("unrecognized", "a"), Some(Choice::AddNew));
        assert_eq!(parse_choice("recognized", "a"), None);
        assert_eq!(parse_choice("not_remembered", "N"), Some(Choice::No));
        assert_eq!(parse_choice("anything", "quit"), Some(Choice::Quit));
        assert_eq!(parse_choice("recognized", ""), None);
    }

    #[test]
    fn test_yes_needs_an_id() {
        assert_eq!(parse_choice("not_remembered", "y"), None);
        assert_eq!(parse_choice("not_remembered", "yes 2"), Some(Choice::Yes("2".into())));
        assert_eq!(parse_choice("unrecognized", "yes 2"), None);
    }

    #[test]
    fn test_prompt_lists_add_new_only_where_allowed() {
        assert!(!prompt_for("recognized").contains("add"));
        assert!(prompt_for("unrecognized").contains("add"));
        assert!(prompt_for("not_remembered").contains("[y]es"));
    }

    #[tokio::test]
    async fn test_release_cancels_after_driver_error() {
        let cancelled = AtomicBool::new(false);
        let cancel = async {
            cancelled.store(true, Ordering::SeqCst);
            Ok(r#"{"state":"ended","disposition":{"kind":"cancelled"}}"#.to_string())
        };
        let err = release(Err(anyhow::anyhow!("input closed")), cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "input closed");
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_driver_outcome() {
        let cancel = async { Err(zbus::Error::Failure("daemon gone".into())) };
        assert!(release(Ok(()), cancel).await.is_ok());
    }
}
