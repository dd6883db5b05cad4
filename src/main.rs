use anyhow::Context;
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use library_seat_booker::domain::clock::{SharedClock, SystemClock};
use library_seat_booker::domain::config::{Credentials, DEFAULT_ENV_FILE, load_booking_config};
use library_seat_booker::domain::session::SessionClient;
use library_seat_booker::domain::session::portal_client::PortalSessionClient;
use library_seat_booker::domain::session::session_cache::{DEFAULT_SESSION_CACHE, SessionCache};
use library_seat_booker::domain::session::spot_fetcher::{SpotFetcher, filter_spots};
use library_seat_booker::loader::parser::list_config_files;
use library_seat_booker::{RunOptions, StartAt, book, logger, prepare_run};

/// Exit status of a run whose session could not be restored.
const EXIT_AUTH_ABORTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "seat-booker", version, about = "Books a library seat the moment the reservation window opens")]
struct Cli {
    /// Directory for booking.log.
    #[arg(long, global = true, default_value = logger::DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// dotenv file with UZH_USERNAME, UZH_PASSWORD and UZH_TOTP_SECRET.
    /// The process environment takes precedence.
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and race for a seat.
    Book {
        #[arg(short, long)]
        config: PathBuf,

        /// Wall-clock time (HH:MM or HH:MM:SS) in the booking's UTC offset to
        /// start the first attempt. A time a few minutes behind now means tomorrow.
        #[arg(long, value_parser = parse_start_at)]
        start_at: Option<NaiveTime>,

        /// Where the authenticated session is kept between runs.
        #[arg(long, default_value = DEFAULT_SESSION_CACHE)]
        session_cache: PathBuf,

        /// Log in even if a cached session is available.
        #[arg(long)]
        fresh_login: bool,

        /// Write the attempts log as CSV after the run.
        #[arg(long)]
        report_csv: Option<PathBuf>,
    },
    /// Print the candidates a run would try, without contacting the portal.
    Candidates {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Check one configuration file.
    Validate { config: PathBuf },
    /// List the configuration files of a directory and whether they are valid.
    ListConfigs {
        #[arg(default_value = "configs")]
        dir: PathBuf,
    },
    /// Log in and list schedules and bookable spots.
    Spots {
        #[arg(short, long)]
        config: PathBuf,

        /// Only list the spots of this schedule id.
        #[arg(long)]
        schedule: Option<i64>,

        /// Case-insensitive search in spot names.
        #[arg(long)]
        search: Option<String>,
    },
}

fn parse_start_at(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| format!("'{}' is not a time of day, expected HH:MM or HH:MM:SS", value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(&cli.log_dir);

    match run(cli.command, &cli.env_file).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, env_file: &Path) -> anyhow::Result<ExitCode> {
    let clock: SharedClock = Arc::new(SystemClock);

    match command {
        Command::Book { config, start_at, session_cache, fresh_login, report_csv } => {
            let (booking_config, generator) = prepare_run(&config, clock.as_ref()).with_context(|| format!("cannot use config '{}'", config.display()))?;
            let credentials = Credentials::from_env_file(env_file)?;
            let options = RunOptions {
                start_at: start_at.map(|time| StartAt::new(time, booking_config.booking.utc_offset)),
                session_cache: Some(SessionCache::new(session_cache)),
                force_login: fresh_login,
            };
            let client = Arc::new(PortalSessionClient::new(booking_config.portal, Arc::clone(&clock)));

            let result = book(client, credentials, booking_config.engine, generator.to_vec(), &options).await.context("initial login failed")?;

            println!("{}", result.summary());
            if let Some(path) = report_csv {
                result.write_csv(&path).with_context(|| format!("cannot write report '{}'", path.display()))?;
            }

            Ok(if result.is_fatal() { ExitCode::from(EXIT_AUTH_ABORTED) } else { ExitCode::SUCCESS })
        }

        Command::Candidates { config } => {
            let (_, generator) = prepare_run(&config, clock.as_ref())?;
            for (position, candidate) in generator.candidates().enumerate() {
                println!("{:>3}. {}", position + 1, candidate);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate { config } => match prepare_run(&config, clock.as_ref()) {
            Ok((_, generator)) => {
                println!("{}: valid ({} candidates)", config.display(), generator.len());
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                println!("{}: invalid: {}", config.display(), e);
                Ok(ExitCode::FAILURE)
            }
        },

        Command::ListConfigs { dir } => {
            let files = list_config_files(&dir).with_context(|| format!("cannot read config directory '{}'", dir.display()))?;
            if files.is_empty() {
                println!("No configuration files in '{}'.", dir.display());
            }
            for file in files {
                let marker = if prepare_run(&file, clock.as_ref()).is_ok() { "valid" } else { "INVALID" };
                println!("{:<8} {}", marker, display_name(&file));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Spots { config, schedule, search } => {
            let booking_config = load_booking_config(&config)?;
            let credentials = Credentials::from_env_file(env_file)?;
            let client = PortalSessionClient::new(booking_config.portal, clock);
            let session = client.authenticate(&credentials).await.context("login failed")?;
            let fetcher = SpotFetcher::new(&client, &session);

            let spots = match (schedule, search) {
                (Some(schedule_id), Some(term)) => filter_spots(fetcher.fetch_spots_for_schedule(schedule_id).await?, &term),
                (Some(schedule_id), None) => fetcher.fetch_spots_for_schedule(schedule_id).await?,
                (None, Some(term)) => fetcher.search_spots(&term).await?,
                (None, None) => {
                    for schedule in fetcher.fetch_schedules().await? {
                        println!("{:>4}  {}{}", schedule.id, schedule.name, if schedule.selected { " (default)" } else { "" });
                    }
                    return Ok(ExitCode::SUCCESS);
                }
            };

            for spot in &spots {
                println!("{:>6}  {:<40} {}{}", spot.id, spot.name, spot.schedule_name, if spot.can_book { "" } else { " (not bookable)" });
            }
            println!("{} spot(s).", spots.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}
