//! easel-admin - CLI for moderation and hosted-user management
//!
//! Usage:
//!   easel-admin timeout <user-id> <minutes> [reason]
//!   easel-admin suspend <user-id> [reason]
//!   easel-admin reactivate <user-id>
//!   easel-admin status <user-id>
//!   easel-admin lock <user-id> <personality>
//!   easel-admin unlock <user-id>
//!   easel-admin host-key <user-id> <api-key> [album-id]
//!   easel-admin host-remove <user-id>

use anyhow::Result;
use std::env;

use easel::convo::ConvoDb;
use easel::paths;
use easel::upload::HostDb;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "timeout" => cmd_timeout(&args[2..])?,
        "suspend" => cmd_suspend(&args[2..])?,
        "reactivate" => cmd_reactivate(&args[2..])?,
        "status" => cmd_status(&args[2..])?,
        "lock" => cmd_lock(&args[2..])?,
        "unlock" => cmd_unlock(&args[2..])?,
        "host-key" => cmd_host_key(&args[2..])?,
        "host-remove" => cmd_host_remove(&args[2..])?,
        "help" | "--help" | "-h" => print_usage(),
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"easel-admin - Manage easel users

Usage:
  easel-admin timeout <user-id> <minutes> [reason]
  easel-admin suspend <user-id> [reason]
  easel-admin reactivate <user-id>
  easel-admin status <user-id>
  easel-admin lock <user-id> <personality>
  easel-admin unlock <user-id>
  easel-admin host-key <user-id> <api-key> [album-id]
  easel-admin host-remove <user-id>

Environment:
  EASEL_DATA_DIR    Override data directory

Paths:
  Conversation DB: {convo}
  Hosting DB:      {hosting}

Examples:
  easel-admin timeout 1234567 30 "prompt spam"
  easel-admin lock 1234567 professional
  easel-admin host-key 1234567 chv_abc123 my-album
"#,
        convo = paths::conversation_db_path().display(),
        hosting = paths::hosting_db_path().display(),
    );
}

fn convo_db() -> Result<ConvoDb> {
    Ok(ConvoDb::open(paths::conversation_db_path())?)
}

fn cmd_timeout(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: easel-admin timeout <user-id> <minutes> [reason]");
    }
    let minutes: i64 = args[1].parse()?;
    let reason = args.get(2).map(|s| s.as_str()).unwrap_or("no reason given");

    convo_db()?.timeout_user(&args[0], minutes, reason, "cli")?;
    println!("Timed out {} for {} minutes: {}", args[0], minutes, reason);
    Ok(())
}

fn cmd_suspend(args: &[String]) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("Usage: easel-admin suspend <user-id> [reason]");
    }
    let reason = args.get(1).map(|s| s.as_str()).unwrap_or("no reason given");

    convo_db()?.suspend_user(&args[0], reason, "cli")?;
    println!("Suspended {}: {}", args[0], reason);
    Ok(())
}

fn cmd_reactivate(args: &[String]) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("Usage: easel-admin reactivate <user-id>");
    }
    convo_db()?.reactivate_user(&args[0])?;
    println!("Reactivated {}", args[0]);
    Ok(())
}

fn cmd_status(args: &[String]) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("Usage: easel-admin status <user-id>");
    }
    let db = convo_db()?;
    let status = db.check_status(&args[0])?;
    let settings = db.get_settings(&args[0])?;

    println!("User {}", args[0]);
    println!("  Status: {}", status.status);
    if let Some(reason) = &status.reason {
        println!("  Reason: {}", reason);
    }
    println!("  Personality: {}", settings.personality);
    if let Some(locked) = &settings.locked_personality {
        println!("  Locked to: {}", locked);
    }
    Ok(())
}

fn cmd_lock(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: easel-admin lock <user-id> <personality>");
    }
    convo_db()?.lock_personality(&args[0], &args[1], "cli")?;
    println!("Locked {} to personality '{}'", args[0], args[1]);
    Ok(())
}

fn cmd_unlock(args: &[String]) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("Usage: easel-admin unlock <user-id>");
    }
    convo_db()?.unlock_personality(&args[0])?;
    println!("Unlocked personality for {}", args[0]);
    Ok(())
}

fn cmd_host_key(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: easel-admin host-key <user-id> <api-key> [album-id]");
    }
    let db = HostDb::open(paths::hosting_db_path())?;
    db.set_user_key(&args[0], &args[1], args.get(2).map(|s| s.as_str()))?;
    println!("Stored hosting key for {}", args[0]);
    Ok(())
}

fn cmd_host_remove(args: &[String]) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("Usage: easel-admin host-remove <user-id>");
    }
    let db = HostDb::open(paths::hosting_db_path())?;
    if db.remove_user(&args[0])? {
        println!("Removed hosting key for {}", args[0]);
    } else {
        println!("No hosting key for {}", args[0]);
    }
    Ok(())
}
