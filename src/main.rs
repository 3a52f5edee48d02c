use std::{
    io::BufRead,
    process::ExitCode,
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use clap::Parser;

use shadowsocks_ui::{
    app::{ShadowsocksApp, Snapshot},
    cli::{Args, Commands},
    configuration::ProxyMode,
    event::{Command, ImportSource},
    installation::InstallationState,
};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const TEST_TIMEOUT: Duration = Duration::from_secs(180);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TICK: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("shadowsocks_ui=info"),
    )
    .init();

    log::info!(
        "shadowsocks-ui v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let args = Args::parse();
    let mut app = ShadowsocksApp::open();

    app.send(Command::CheckInstallation);
    app.pump_until(CHECK_TIMEOUT, |app| {
        !matches!(app.installation(), InstallationState::Checking)
    });
    log::info!("[startup] client: {}", app.installation().label());

    let code = match args.command.unwrap_or(Commands::List) {
        Commands::List => {
            print_profiles(&app.snapshot());
            ExitCode::SUCCESS
        }
        Commands::Link => match app.current_share_link() {
            Ok(link) => {
                println!("{link}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("{error}");
                ExitCode::FAILURE
            }
        },
        Commands::Import { file } => import(&mut app, ImportSource::File(file)),
        Commands::Subscribe { url } => {
            match url.or_else(|| app.settings().subscription_url.clone()) {
                Some(url) => import(&mut app, ImportSource::Subscription(url)),
                None => {
                    eprintln!("no subscription URL given or saved");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::FreeNodes => import(&mut app, ImportSource::FreeNodes),
        Commands::Test => test_all(&mut app),
        Commands::Install => install(&mut app),
        Commands::Connect { profile, mode } => connect(&mut app, profile, mode),
    };

    app.shutdown();
    code
}

fn print_profiles(snapshot: &Snapshot) {
    if snapshot.profiles.is_empty() {
        println!("no servers");
        return;
    }
    for (index, profile) in snapshot.profiles.iter().enumerate() {
        let marker = if snapshot.current.as_ref() == Some(&profile.id) {
            "*"
        } else {
            " "
        };
        let ping = profile
            .last_ping
            .map_or("-".to_string(), |ping| format!("{ping}ms"));
        let speed = profile
            .last_speed
            .map_or("-".to_string(), |speed| format!("{speed:.2}MB/s"));
        println!(
            "{marker} {index:>2}  {:<24} {}:{:<6} {:<24} {:>8} ({}) {:>10}",
            profile.name,
            profile.address,
            profile.port,
            profile.method,
            ping,
            profile.ping_status().label(),
            speed,
        );
    }
}

fn import(app: &mut ShadowsocksApp, source: ImportSource) -> ExitCode {
    app.send(Command::Import(source));
    app.pump_until(FETCH_TIMEOUT, |app| {
        app.last_import().is_some() || app.last_error().is_some()
    });
    match (app.last_import(), app.last_error()) {
        (Some(report), _) => {
            println!(
                "imported {} servers ({} failed)",
                report.imported, report.failed
            );
            ExitCode::SUCCESS
        }
        (None, Some(error)) => {
            eprintln!("import failed: {error}");
            ExitCode::FAILURE
        }
        (None, None) => {
            eprintln!("import timed out");
            ExitCode::FAILURE
        }
    }
}

fn test_all(app: &mut ShadowsocksApp) -> ExitCode {
    app.send(Command::TestAll);
    app.pump_until(CONNECT_TICK, |app| app.is_testing());
    if !app.pump_until(TEST_TIMEOUT, |app| !app.is_testing()) {
        eprintln!("test timed out");
        return ExitCode::FAILURE;
    }
    app.send(Command::RankBest);
    app.pump_until(CONNECT_TICK, |_| false);
    print_profiles(&app.snapshot());
    ExitCode::SUCCESS
}

fn install(app: &mut ShadowsocksApp) -> ExitCode {
    if app.installation().is_installed() {
        println!("{}", app.installation().label());
        return ExitCode::SUCCESS;
    }
    app.send(Command::Install);
    app.pump_until(INSTALL_TIMEOUT, |app| {
        matches!(
            app.installation(),
            InstallationState::Installed(_) | InstallationState::Error(_)
        )
    });
    println!("{}", app.installation().label());
    if app.installation().is_installed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn stdin_lines() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                return;
            }
        }
        let _ = sender.send("quit".into());
    });
    receiver
}

fn connect(app: &mut ShadowsocksApp, profile: Option<String>, mode: Option<ProxyMode>) -> ExitCode {
    if let Some(wanted) = profile {
        let Some(id) = app
            .repository()
            .list()
            .iter()
            .find(|candidate| candidate.id.as_str() == wanted || candidate.name == wanted)
            .map(|candidate| candidate.id.clone())
        else {
            eprintln!("no server named {wanted}");
            return ExitCode::FAILURE;
        };
        app.dispatch(Command::SelectProfile(id).into());
    }

    if let Some(mode) = mode {
        app.dispatch(Command::SetProxyMode(mode).into());
    }

    app.dispatch(Command::Start.into());
    if let Some(error) = app.last_error() {
        eprintln!("connect failed: {error}");
        return ExitCode::FAILURE;
    }

    let lines = stdin_lines();
    let mut last_state = app.supervisor().state().clone();
    println!("{}", last_state.label());

    while !app.is_quitting() {
        app.pump_until(CONNECT_TICK, |app| app.is_quitting());

        let state = app.supervisor().state();
        if *state != last_state {
            if state.is_error() {
                eprintln!("{}", state.label());
            } else {
                println!("{}", state.label());
            }
            last_state = state.clone();
        }

        while let Ok(line) = lines.try_recv() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("mode ") {
                match ProxyMode::parse(value) {
                    Some(mode) => app.send(Command::SetProxyMode(mode)),
                    None => eprintln!("unknown proxy mode: {value} (global, pac, manual)"),
                }
                continue;
            }
            match line {
                "" => {}
                "stop" => app.send(Command::Stop),
                "restart" => app.send(Command::Restart),
                "start" => app.send(Command::Start),
                "status" => print_status(&app.snapshot()),
                "quit" | "exit" => app.send(Command::Quit),
                other => eprintln!(
                    "unknown command: {other} (stop, restart, start, status, mode <m>, quit)"
                ),
            }
        }
    }
    ExitCode::SUCCESS
}

fn print_status(snapshot: &Snapshot) {
    let (download, upload) = snapshot.traffic_totals;
    println!("state:    {}", snapshot.connection.label());
    println!("client:   {}", snapshot.installation.label());
    println!("retries:  {}", snapshot.retries);
    println!("traffic:  {download} B down, {upload} B up");
    if let Some(latest) = snapshot.traffic.last() {
        println!(
            "rate:     {} B/s down, {} B/s up",
            latest.download, latest.upload
        );
    }
    for line in snapshot.log.iter().rev().take(5).rev() {
        println!("  | {line}");
    }
}
