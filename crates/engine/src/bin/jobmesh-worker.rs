//! jobmesh-worker: runs the jobs of a YAML job file on this node.
//!
//! Partitioned jobs are spread over the members given with `--members`;
//! generic jobs run on every member. Members are written `name` or
//! `name[key=value;key=value]`; the attributes are what node filters such as
//! `zone:eu` match against, so every node must be started with the same
//! member list. Stops on Ctrl-C after draining running
//! jobs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use jobmesh_cluster::{JobDistributor, MembershipResolver, NodeFilter, NodeIdentity, NodeInfo};
use jobmesh_core::{config::load_dotenv, Config, JobKey, NodeId, Partitioning, DEFAULT_GROUP};
use jobmesh_engine::{JobDefinition, JobRegistry, MemoryJobStore, SchedulerBuilder};
use jobmesh_schedule::{Schedule, ScheduleRegistry, Scope};

// ── CLI ─────────────────────────────────────────────────────────────

/// Cluster-aware interval job runner.
#[derive(Parser, Debug)]
#[command(name = "jobmesh-worker", version, about)]
struct Cli {
    /// YAML file listing the jobs to schedule.
    #[arg(long, env = "JOBMESH_JOBS_FILE", default_value = "jobs.yaml")]
    jobs: String,

    /// Cluster members, comma separated, each `name` or
    /// `name[key=value;...]`. The local node is always included with the
    /// attributes from JOBMESH_NODE_ATTRIBUTES.
    #[arg(long, env = "JOBMESH_MEMBERS", value_delimiter = ',')]
    members: Vec<String>,

    /// Configuration profile (overrides JOBMESH_PROFILE).
    #[arg(long)]
    profile: Option<String>,
}

// ── Job file ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobEntry {
    name: String,
    #[serde(default = "default_group")]
    group: String,
    kind: String,
    #[serde(default)]
    generic: bool,
    #[serde(default)]
    description: Option<String>,
    schedule: Value,
    #[serde(default)]
    data: Map<String, Value>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Read and validate a job file. Every schedule is checked before anything
/// is scheduled.
fn load_jobs(
    path: &Path,
    schedules: &ScheduleRegistry,
    jobs: &JobRegistry,
) -> anyhow::Result<Vec<(JobDefinition, Schedule)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job file {}", path.display()))?;
    let file: JobFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse job file {}", path.display()))?;

    let mut loaded = Vec::with_capacity(file.jobs.len());
    for entry in file.jobs {
        let key = JobKey::new(&entry.name, &entry.group)?;
        if !jobs.contains(&entry.kind) {
            bail!(
                "job {key}: unknown kind '{}' (known: {})",
                entry.kind,
                jobs.kinds().join(", ")
            );
        }
        let schedule = schedules
            .parse(&entry.schedule, Scope::Job)
            .with_context(|| format!("job {key}"))?;

        let definition = JobDefinition {
            key,
            kind: entry.kind,
            partitioning: Partitioning::from_generic_flag(entry.generic),
            description: entry.description,
            data: entry.data,
        };
        loaded.push((definition, schedule));
    }
    Ok(loaded)
}

/// Parse one `--members` entry: `name` or `name[key=value;key=value]`.
fn parse_member(raw: &str) -> anyhow::Result<NodeInfo> {
    let raw = raw.trim();
    let (name, attributes) = match raw.split_once('[') {
        Some((name, rest)) => {
            let Some(body) = rest.strip_suffix(']') else {
                bail!("member '{raw}': attribute list must end with ']'");
            };
            let mut attributes = BTreeMap::new();
            for pair in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("member '{raw}': expected key=value, got '{pair}'");
                };
                let key = key.trim();
                if key.is_empty() {
                    bail!("member '{raw}': attribute name must not be empty");
                }
                attributes.insert(key.to_string(), value.trim().to_string());
            }
            (name.trim(), attributes)
        }
        None => (raw, BTreeMap::new()),
    };
    let id = NodeId::new(name).with_context(|| format!("member '{raw}'"))?;
    Ok(NodeInfo::new(id.as_str(), id.as_str()).with_attributes(attributes))
}

/// Local node plus the parsed peers. An attribute filter is refused when a
/// peer carries no attributes, since that peer would drop out of every
/// node's view and ownership would diverge.
fn membership(local: NodeInfo, members: &[String], filter: Option<&str>) -> anyhow::Result<Vec<NodeInfo>> {
    let mut nodes = vec![local];
    for raw in members.iter().filter(|m| !m.trim().is_empty()) {
        let member = parse_member(raw)?;
        if member.name != nodes[0].name {
            nodes.push(member);
        }
    }

    let filter = NodeFilter::parse(filter.unwrap_or_default()).context("invalid node filter")?;
    if filter.uses_attributes() {
        if let Some(bare) = nodes.iter().find(|n| n.attributes.is_empty()) {
            bail!(
                "node filter '{filter}' matches on attributes but member '{}' declares none; \
                 list peers as name[key=value;...]",
                bare.name
            );
        }
    }
    Ok(nodes)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = match &cli.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    config.log_summary();

    let local = NodeInfo::new(&config.node.name, &config.node.name)
        .with_attributes(config.node.attributes.clone());
    let resolver = Arc::new(MembershipResolver::with_members(
        NodeIdentity::ByName,
        membership(local, &cli.members, config.node.filter.as_deref())?,
    ));
    let distributor = Arc::new(JobDistributor::new(
        config.scheduler.name.clone(),
        config.node.filter.clone(),
        resolver,
        config.node.name.clone(),
    ));

    let job_registry = Arc::new(JobRegistry::with_builtin_kinds());
    let jobs = load_jobs(Path::new(&cli.jobs), &ScheduleRegistry::with_defaults(), &job_registry)?;
    info!(path = %cli.jobs, jobs = jobs.len(), "loaded job file");

    let scheduler = SchedulerBuilder::from_config(config.scheduler.clone())
        .node_name(config.node.name.clone())
        .job_store(Arc::new(MemoryJobStore::new()))
        .job_factory(job_registry)
        .distributor(Arc::clone(&distributor))
        .build()
        .context("failed to build scheduler")?;

    for (definition, schedule) in jobs {
        let key = definition.key.clone();
        scheduler
            .schedule_job(definition, &schedule)
            .with_context(|| format!("failed to schedule job {key}"))?;
    }
    scheduler.start()?;

    let state = distributor.state();
    info!(
        node = %config.node.name,
        node_count = state.node_count,
        local_index = ?state.local_index,
        "worker running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining running jobs");
    tokio::task::spawn_blocking(move || scheduler.shutdown(true)).await?;
    Ok(())
}
