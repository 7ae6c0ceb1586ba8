use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dagent_config::{AgentLookupExt, AgentRegistry, DeployAgent, LayeredSettings};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "dagent-agents", version, about = "Manage deployment agent endpoints for dagent")]
struct Args {
    /// Workspace root holding .dagent/ (defaults to the current directory)
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListFormat {
    Detailed,
    Short,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List registered agents
    List {
        #[arg(long, value_enum, default_value_t = ListFormat::Detailed)]
        format: ListFormat,
    },
    /// Register a new agent
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        protocol_version: Option<u32>,
        #[arg(long)]
        contact: Option<String>,
        /// Register the agent disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Remove an agent by name
    Remove {
        #[arg(long)]
        name: String,
    },
    /// Enable an agent by name
    Enable {
        #[arg(long)]
        name: String,
    },
    /// Disable an agent by name
    Disable {
        #[arg(long)]
        name: String,
    },
    /// Update the endpoint or protocol version of an existing agent
    Update {
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        protocol_version: Option<u32>,
    },
    /// Resolve a name or endpoint to a concrete endpoint
    Resolve { value: String },
    /// Show the active agent, or set it by name
    Active { name: Option<String> },
}

/// An agent endpoint is an absolute URL or an absolute path.
fn is_valid_endpoint(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("file://")
        || Path::new(value).is_absolute()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let settings = LayeredSettings::open(&args.workspace)?;
    let registry = AgentRegistry::new(settings);

    match args.command {
        Command::List { format } => list(&registry, format)?,
        Command::Add { name, endpoint, protocol_version, contact, disabled } => {
            add(&registry, name, endpoint, protocol_version, contact, disabled)?
        }
        Command::Remove { name } => {
            require_agent(&registry, &name)?;
            registry.remove(&name)?;
            println!("removed agent '{name}'");
        }
        Command::Enable { name } => set_enabled(&registry, &name, true)?,
        Command::Disable { name } => set_enabled(&registry, &name, false)?,
        Command::Update { name, endpoint, protocol_version } => {
            update(&registry, name, endpoint, protocol_version)?
        }
        Command::Resolve { value } => match registry.resolve_endpoint(&value) {
            Some(endpoint) => println!("{endpoint}"),
            None => bail!("nothing to resolve"),
        },
        Command::Active { name: Some(name) } => {
            let agent = require_agent(&registry, &name)?;
            registry.save_active_agent(&agent);
            println!("active agent is now '{}'", agent.name);
        }
        Command::Active { name: None } => match registry.active_agent_name() {
            Some(name) => println!("{name}"),
            None => println!("(no active agent)"),
        },
    }
    Ok(())
}

fn require_agent(registry: &AgentRegistry<LayeredSettings>, name: &str) -> Result<DeployAgent> {
    match registry.get_by_name(name)? {
        Some(agent) => Ok(agent),
        None => bail!("no agent named '{name}' is registered"),
    }
}

fn list(registry: &AgentRegistry<LayeredSettings>, format: ListFormat) -> Result<()> {
    let agents = registry.load_agents();
    match format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&agents)?),
        ListFormat::Short => {
            for agent in &agents {
                let flag = if agent.is_enabled { 'E' } else { 'D' };
                println!("{flag} {} {}", agent.name, agent.endpoint);
            }
        }
        ListFormat::Detailed => {
            if agents.is_empty() {
                println!("no agents registered");
            }
            for (i, agent) in agents.iter().enumerate() {
                let status = if agent.is_enabled { "Enabled" } else { "Disabled" };
                println!("{:3}. {} [{status}]", i + 1, agent.name);
                println!("     {}", agent.endpoint);
            }
        }
    }
    Ok(())
}

fn add(
    registry: &AgentRegistry<LayeredSettings>,
    name: String,
    endpoint: String,
    protocol_version: Option<u32>,
    contact: Option<String>,
    disabled: bool,
) -> Result<()> {
    if name.eq_ignore_ascii_case("all") {
        bail!("the agent name 'all' is reserved");
    }
    if !is_valid_endpoint(&endpoint) {
        bail!("'{endpoint}' is not a valid endpoint (absolute URL or path expected)");
    }
    if registry.get_by_name(&name)?.is_some() {
        bail!("an agent named '{name}' is already registered");
    }
    if registry.get_by_endpoint(&endpoint)?.is_some() {
        bail!("an agent with endpoint '{endpoint}' is already registered");
    }

    let mut agent = DeployAgent::new(&name, endpoint).enabled(!disabled);
    if let Some(version) = protocol_version {
        agent = agent.with_protocol_version(version);
    }
    if let Some(contact) = contact {
        agent = agent.with_contact(contact);
    }
    registry.add(&agent)?;
    println!("added agent '{name}'");
    Ok(())
}

fn set_enabled(registry: &AgentRegistry<LayeredSettings>, name: &str, enabled: bool) -> Result<()> {
    let agent = require_agent(registry, name)?;
    if agent.is_enabled != enabled {
        if enabled {
            registry.enable(name)?;
        } else {
            registry.disable(name)?;
        }
    }
    println!("agent '{name}' is now {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn update(
    registry: &AgentRegistry<LayeredSettings>,
    name: String,
    endpoint: Option<String>,
    protocol_version: Option<u32>,
) -> Result<()> {
    let mut agent = require_agent(registry, &name)?;
    if let Some(endpoint) = endpoint {
        if !agent.endpoint.eq_ignore_ascii_case(&endpoint) {
            if !is_valid_endpoint(&endpoint) {
                bail!("'{endpoint}' is not a valid endpoint (absolute URL or path expected)");
            }
            if registry.get_by_endpoint(&endpoint)?.is_some() {
                bail!("an agent with endpoint '{endpoint}' is already registered");
            }
            agent.endpoint = endpoint;
        }
    }
    if let Some(version) = protocol_version {
        agent.protocol_version = version;
    }
    registry.update(&agent, false)?;
    println!("updated agent '{name}'");
    Ok(())
}
