mod logger;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::warn;

use vpctun_lib::common::cidr::Cidr;
use vpctun_lib::config::{InstanceSelector, StartConfig};
use vpctun_lib::routing::RouteManager;
use vpctun_lib::session::{self, SessionStore};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = Command::new("vpctun")
        .about("Transparent tunnel into a private network over the cloud session manager")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("verbose log"),
        )
        .subcommands([
            Command::new("start")
                .about("Start a transparent tunnel session (blocks until interrupted)")
                .arg(Arg::new("instance-id").long("instance-id").help("jump host instance id (e.g. i-1234567890abcdef0)"))
                .arg(Arg::new("instance-tag").long("instance-tag").help("find the jump host by tag (Key=Value, single match required)"))
                .arg(
                    Arg::new("cidr")
                        .long("cidr")
                        .action(ArgAction::Append)
                        .help("destination prefix to capture, repeatable (e.g. 10.0.0.0/8)"),
                )
                .arg(Arg::new("local-ip").long("local-ip").default_value("169.254.169.1/30").help("address for the virtual interface"))
                .arg(Arg::new("mtu").long("mtu").value_parser(clap::value_parser!(u32)).default_value("1500"))
                .arg(Arg::new("socks-port").long("socks-port").value_parser(clap::value_parser!(u16)).default_value("1080").help("local port the egress tunnel listens on"))
                .arg(Arg::new("session-name").long("session-name").help("custom session name (default: generated)"))
                .arg(Arg::new("ssh-user").long("ssh-user").default_value("ec2-user"))
                .arg(Arg::new("keep-alive").long("keep-alive").value_parser(clap::value_parser!(u64)).default_value("30").help("health check interval in seconds"))
                .arg(Arg::new("reconnect-delay").long("reconnect-delay").value_parser(clap::value_parser!(u64)).default_value("5").help("delay between reconnection attempts in seconds"))
                .arg(Arg::new("max-retries").long("max-retries").value_parser(clap::value_parser!(u32)).default_value("0").help("maximum reconnection attempts (0 = unlimited)"))
                .arg(Arg::new("auto-reconnect").long("auto-reconnect").value_parser(clap::value_parser!(bool)).default_value("true"))
                .arg(Arg::new("dns-resolver").long("dns-resolver").help("dns server reachable through the tunnel (ip:port)"))
                .arg(
                    Arg::new("dns-domains")
                        .long("dns-domains")
                        .action(ArgAction::Append)
                        .value_delimiter(',')
                        .help("domain suffixes to capture; empty captures all queries"),
                )
                .arg(Arg::new("profile").long("profile").help("cloud credentials profile"))
                .arg(Arg::new("region").long("region")),
            Command::new("stop")
                .about("Stop running sessions by signalling their processes")
                .arg(Arg::new("session-name").long("session-name").help("stop one session by name (default: most recent)"))
                .arg(Arg::new("all").long("all").action(ArgAction::SetTrue).help("stop every session"))
                .arg(Arg::new("force").long("force").action(ArgAction::SetTrue).help("SIGKILL instead of SIGTERM")),
            Command::new("status").about("List active sessions, reaping stale ones"),
            Command::new("instances")
                .about("List candidate jump hosts (read-only)")
                .arg(Arg::new("tag").long("tag").action(ArgAction::Append).help("filter by tag (Key=Value, repeatable)"))
                .arg(Arg::new("profile").long("profile"))
                .arg(Arg::new("region").long("region")),
            Command::new("version").about("Show current version"),
        ])
        .get_matches();

    logger::init(matches.get_flag("verbose"));

    match matches.subcommand() {
        Some(("start", matches)) => command_start(matches),
        Some(("stop", matches)) => command_stop(matches),
        Some(("status", _)) => command_status(),
        Some(("instances", matches)) => command_instances(matches),
        Some(("version", _)) => {
            println!("vpctun version {}", vpctun_lib::version::VERSION);
            0
        }
        _ => {
            eprintln!("no command given; see `vpctun --help`");
            2
        }
    }
}

fn command_start(matches: &ArgMatches) -> i32 {
    let instance_id = matches.get_one::<String>("instance-id");
    let instance_tag = matches.get_one::<String>("instance-tag");
    let selector = match (instance_id, instance_tag) {
        (Some(_), Some(_)) => {
            return fatal_config("cannot specify both --instance-id and --instance-tag")
        }
        (None, None) => return fatal_config("either --instance-id or --instance-tag is required"),
        (Some(id), None) => InstanceSelector::Id(id.clone()),
        (None, Some(tag)) => match InstanceSelector::from_tag(tag) {
            Ok(selector) => selector,
            Err(e) => return fatal(&e),
        },
    };

    let prefixes: Vec<String> = matches
        .get_many::<String>("cidr")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if prefixes.is_empty() {
        return fatal_config("at least one --cidr is required");
    }

    let mut config = StartConfig::new(selector, prefixes);
    config.session_name = matches.get_one::<String>("session-name").cloned();
    config.local_ip = matches.get_one::<String>("local-ip").unwrap().clone();
    config.mtu = *matches.get_one::<u32>("mtu").unwrap();
    config.socks_port = *matches.get_one::<u16>("socks-port").unwrap();
    config.ssh_user = matches.get_one::<String>("ssh-user").unwrap().clone();
    config.keep_alive_secs = *matches.get_one::<u64>("keep-alive").unwrap();
    config.reconnect_delay_secs = *matches.get_one::<u64>("reconnect-delay").unwrap();
    config.max_retries = *matches.get_one::<u32>("max-retries").unwrap();
    config.auto_reconnect = *matches.get_one::<bool>("auto-reconnect").unwrap();
    config.dns_resolver = matches.get_one::<String>("dns-resolver").cloned();
    config.dns_domains = matches
        .get_many::<String>("dns-domains")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    config.profile = matches.get_one::<String>("profile").cloned();
    config.region = matches.get_one::<String>("region").cloned();

    println!("vpctun - transparent network tunnel");
    println!("capturing {} prefix(es); applications need no configuration", config.prefixes.len());
    println!("press ctrl-c to stop and clean up");
    println!();

    match vpctun_lib::run(config) {
        Ok(()) => {
            println!("session ended cleanly");
            0
        }
        Err(e) => fatal(&e),
    }
}

fn command_stop(matches: &ArgMatches) -> i32 {
    let store = SessionStore::new();
    let force = matches.get_flag("force");

    let sessions = if matches.get_flag("all") {
        match store.list() {
            Ok(sessions) => sessions,
            Err(e) => {
                eprintln!("error: failed to list sessions: {}", e);
                return 1;
            }
        }
    } else {
        let name = match matches.get_one::<String>("session-name") {
            Some(name) => name.clone(),
            None => match store.list() {
                // most recent session by default
                Ok(sessions) => match sessions.into_iter().next() {
                    Some(session) => session.name,
                    None => {
                        println!("no active sessions found");
                        return 0;
                    }
                },
                Err(e) => {
                    eprintln!("error: failed to list sessions: {}", e);
                    return 1;
                }
            },
        };
        match store.get(&name) {
            Ok(session) => vec![session],
            Err(e) => {
                eprintln!("error: {}", e);
                return 1;
            }
        }
    };

    if sessions.is_empty() {
        println!("no active sessions found");
        return 0;
    }

    for sess in sessions {
        println!("stopping session {} (pid {})", sess.name, sess.pid);
        if session::process_alive(sess.pid) {
            if let Err(e) = session::signal_process(sess.pid, force) {
                warn!("failed to signal pid {}: {}", sess.pid, e);
            }
            continue; // the owning process runs its own teardown
        }

        // owner already gone: best-effort route cleanup, then drop the record
        let routes = RouteManager::new();
        for prefix in &sess.prefixes {
            if let Ok(cidr) = Cidr::parse(prefix) {
                if let Err(e) = routes.remove(&cidr) {
                    warn!("failed to remove route {}: {}", prefix, e);
                }
            }
        }
        if let Err(e) = store.remove(&sess.name) {
            warn!("failed to remove session record {}: {}", sess.name, e);
        }
    }
    0
}

fn command_status() -> i32 {
    let store = SessionStore::new();
    match store.remove_stale() {
        Ok(removed) => {
            for name in removed {
                println!("reaped stale session: {}", name);
            }
        }
        Err(e) => warn!("failed to reap stale sessions: {}", e),
    }

    let sessions = match store.list() {
        Ok(sessions) => sessions,
        Err(e) => {
            eprintln!("error: failed to list sessions: {}", e);
            return 1;
        }
    };
    if sessions.is_empty() {
        println!("no active sessions");
        return 0;
    }

    println!(
        "{:<20} {:<20} {:<8} {:<8} {:<25} prefixes",
        "NAME", "INSTANCE", "DEVICE", "PID", "STARTED"
    );
    for sess in sessions {
        println!(
            "{:<20} {:<20} {:<8} {:<8} {:<25} {}",
            sess.name,
            sess.instance_id,
            sess.tun_device,
            sess.pid,
            sess.started_at.to_rfc3339(),
            sess.prefixes.join(", ")
        );
    }
    0
}

fn command_instances(matches: &ArgMatches) -> i32 {
    let filters: Vec<(String, String)> = matches
        .get_many::<String>("tag")
        .map(|values| {
            values
                .filter_map(|spec| {
                    spec.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    let profile = matches.get_one::<String>("profile").cloned();
    let region = matches.get_one::<String>("region").cloned();

    match vpctun_lib::list_instances(profile, region, filters) {
        Ok(instances) => {
            if instances.is_empty() {
                println!("no running instances found");
                return 0;
            }
            println!(
                "{:<20} {:<25} {:<12} {:<15} {:<12} agent",
                "INSTANCE", "NAME", "TYPE", "PRIVATE IP", "AZ"
            );
            for instance in instances {
                println!(
                    "{:<20} {:<25} {:<12} {:<15} {:<12} {}",
                    instance.instance_id,
                    instance.name,
                    instance.instance_type,
                    instance.private_ip,
                    instance.availability_zone,
                    if instance.agent_connected { "online" } else { "offline" }
                );
            }
            0
        }
        Err(e) => fatal(&e),
    }
}

fn fatal(error: &vpctun_lib::Error) -> i32 {
    eprintln!("error: {}", error);
    if let Some(hint) = error.remediation() {
        eprintln!("  hint: {}", hint);
    }
    1
}

fn fatal_config(message: &str) -> i32 {
    eprintln!("error: invalid configuration: {}", message);
    eprintln!("  hint: check the command line flags; see `vpctun start --help`");
    1
}
