use clap::{Parser, Subcommand};
use std::path::PathBuf;

use axis::{
    crawler,
    db::{conn::DatabaseConnection, models::TaskStatusCode},
    error::Error,
    inventory::Job,
    key::Key,
    publish,
    settings::Settings,
    utils::{create_dir_if_not_exists, systemtime_to_utc_string},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML file containing the program settings
    #[arg(short, long)]
    settings: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the jobs of a job file against their hosts
    Run {
        /// Inventory directory holding jobs/, groups/ and hosts/
        #[arg(short, long)]
        inventory: PathBuf,

        /// Name of the job file, without extension
        #[arg(short, long)]
        job: String,
    },
    /// Queue a task bundle for every agent of a group
    Publish {
        #[arg(short, long)]
        group: String,

        #[arg(short, long)]
        task: String,
    },
    /// Manage registered agents
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Show the logs reported by an agent
    Logs {
        #[arg(short, long)]
        agent: String,

        /// Maximum number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },
    /// Print the key fingerprint of this agent, creating the key if needed
    Finger {},
    /// Discover hosts on the local networks
    Scan {},
    CheckDatabase {
        /// Create missing tables
        #[arg(long, default_value_t = false)]
        init: bool,
    },
    ValidateSettings {},
}

#[derive(Subcommand, Debug)]
enum AgentAction {
    List {},
    /// Allow the agent to receive tasks
    Accept { sn: String },
    /// Stop sending tasks to the agent
    Reject { sn: String },
    Delete { sn: String },
}

fn main() -> Result<(), Error> {
    let args: Args = Args::parse();
    let s = Settings::load(&args.settings)?;
    s.setup_logging("axis")?;
    match args.command {
        Commands::Run { inventory, job } => run(&s, inventory, &job),
        Commands::Publish { group, task } => publish_task(&s, &group, &task),
        Commands::Agents { action } => agents(&s, action),
        Commands::Logs { agent, limit } => logs(&s, &agent, limit),
        Commands::Finger {} => finger(&s),
        Commands::Scan {} => scan(&s),
        Commands::CheckDatabase { init } => check_database(&s, init),
        Commands::ValidateSettings {} => validate_settings(s),
    }
}

/// Runs every job in the job file, stopping at the first failure.
fn run(s: &Settings, inventory: PathBuf, job: &str) -> Result<(), Error> {
    let inventory = inventory.canonicalize().map_err(|e| {
        let errmsg = format!("Invalid inventory {}: {e}", inventory.display());
        log::error!("{}", errmsg);
        Error::from(errmsg)
    })?;
    create_dir_if_not_exists(&s.temp_dir)?;
    for it in Job::load(&inventory, job)? {
        it.run(&inventory, s)?;
    }
    log::info!("Job {job} done");
    Ok(())
}

fn publish_task(s: &Settings, group: &str, task: &str) -> Result<(), Error> {
    let mut conn = DatabaseConnection::connect(s)?;
    let queued = publish::publish(s, &mut conn, group, task)?;
    println!("Queued task {task} for {} agent(s) of {group}", queued.len());
    Ok(())
}

fn agents(s: &Settings, action: AgentAction) -> Result<(), Error> {
    let mut conn = DatabaseConnection::connect(s)?;
    let (sn, found, verb) = match action {
        AgentAction::List {} => {
            println!(
                "{:<24} {:<8} {:<24} {}",
                "NAME", "ENABLED", "LAST SEEN", "FINGERPRINT"
            );
            for agent in conn.list_agents()? {
                let last_seen = agent
                    .last_seen
                    .as_ref()
                    .and_then(systemtime_to_utc_string)
                    .unwrap_or("never".to_string());
                let fingerprint = agent
                    .key
                    .parse::<Key>()
                    .map_or("invalid".to_string(), |k| k.fingerprint());
                println!(
                    "{:<24} {:<8} {:<24} {}",
                    agent.sn, agent.enabled, last_seen, fingerprint
                );
            }
            return Ok(());
        }
        AgentAction::Accept { sn } => {
            let found = conn.set_agent_enabled(&sn, true)?;
            (sn, found, "accepted")
        }
        AgentAction::Reject { sn } => {
            let found = conn.set_agent_enabled(&sn, false)?;
            (sn, found, "rejected")
        }
        AgentAction::Delete { sn } => {
            let found = conn.delete_agent(&sn)?;
            (sn, found, "deleted")
        }
    };
    if !found {
        return Error::err_string(format!("No agent named {sn}"));
    }
    log::info!("Agent {sn} {verb}");
    Ok(())
}

fn logs(s: &Settings, sn: &str, limit: i64) -> Result<(), Error> {
    let mut conn = DatabaseConnection::connect(s)?;
    let agent = conn
        .agent_by_sn(sn)?
        .ok_or_else(|| Error::from(format!("No agent named {sn}")))?;
    for it in conn.logs_by_agent(agent.id, Some(limit))? {
        println!(
            "[{} {} {}]\n{}\n",
            systemtime_to_utc_string(&it.created_at).unwrap_or("NO_TIME".to_string()),
            it.ip,
            it.task,
            it.message
        );
    }
    Ok(())
}

fn finger(s: &Settings) -> Result<(), Error> {
    let key = Key::load_or_create(&s.agent.key_file)?;
    println!("{} {}", s.agent.id, key.fingerprint());
    Ok(())
}

fn scan(s: &Settings) -> Result<(), Error> {
    for host in crawler::run(s)? {
        println!("{host}");
    }
    Ok(())
}

/// Checks the database connection
fn check_database(s: &Settings, init: bool) -> Result<(), Error> {
    log::info!("CHECKING DATABASE");

    log::debug!("Opening database connection");
    let mut dbconn = DatabaseConnection::connect(s)?;

    if init {
        dbconn.setup_schema()?;
    }

    let agents = dbconn.list_agents()?;
    println!("{} agent(s) registered", agents.len());
    for (task, sn) in dbconn.recent_tasks(10)? {
        println!(
            "{} {} {} {}",
            systemtime_to_utc_string(&task.date_queued).unwrap_or("NO_TIME".to_string()),
            task.uuid,
            sn,
            task.status()
                .map_or("Unknown".to_string(), |c: TaskStatusCode| c.to_string())
        );
    }

    log::debug!("Done connecting");
    Ok(())
}

/// Validates the loaded settings, used for printing them out
fn validate_settings(s: Settings) -> Result<(), Error> {
    log::info!("VALIDATING SETTINGS");
    dbg!(&s);
    Ok(())
}
