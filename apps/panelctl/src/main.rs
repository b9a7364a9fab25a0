use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::error;

use broker::{BrokerOptions, MissingBrokerLink, MqttBrokerLink};
use panel_core::{load_settings, PanelClient, PanelEvent, Settings};
use panel_core::config::prepare_database_url;
use shared::{
    domain::{CurrencyPair, LinkStatus, LogEntry},
    protocol::{ExchangeSnapshot, LedSettingsUpdate, MessageRecord, WeatherSnapshot},
};
use storage::{LogJournal, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "panelctl", about = "Console for the LED panel bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backend health and broker link status.
    Status,
    /// Stream broker traffic and status changes until interrupted.
    Watch,
    /// Weather snapshots and the station location.
    Weather {
        #[command(subcommand)]
        command: WeatherCommand,
    },
    /// Exchange rates for a currency pair.
    Exchange {
        #[command(subcommand)]
        command: ExchangeCommand,
    },
    /// Free-form messages for the panel.
    Message {
        #[command(subcommand)]
        command: MessageCommand,
    },
    /// Apply scroll speed, brightness, or display mode.
    Led {
        #[arg(long)]
        speed: Option<u32>,
        #[arg(long)]
        brightness: Option<u32>,
        #[arg(long)]
        mode: Option<String>,
    },
    /// Rotate time, weather, and exchange rates on the panel.
    Auto {
        #[command(subcommand)]
        command: AutoCommand,
    },
    /// Push a single display to the panel.
    Display {
        #[command(subcommand)]
        command: DisplayCommand,
    },
    /// Merged backend and local activity log.
    Logs {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        topic: Option<String>,
        /// Skip the backend and read only the local journal.
        #[arg(long)]
        local_only: bool,
        #[command(subcommand)]
        command: Option<LogsCommand>,
    },
    /// Publish a raw payload on a topic.
    Publish { topic: String, payload: String },
}

#[derive(Subcommand, Debug)]
enum WeatherCommand {
    /// Latest snapshot from the backend.
    Current,
    /// Point the weather feed at new coordinates.
    SetLocation {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
    },
    /// Recent snapshots, newest first.
    History {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum ExchangeCommand {
    /// Latest rate for a pair.
    Current {
        #[arg(default_value = "USD/VND")]
        pair: String,
    },
    /// Push the rate for a pair to the panel.
    Display { pair: String },
    /// Recent rates, newest first.
    History {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum MessageCommand {
    /// Send a message to the panel.
    Send {
        text: String,
        #[arg(long, default_value = "scroll")]
        mode: String,
    },
    /// Recently sent messages, newest first.
    History {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum AutoCommand {
    /// Run the rotation in the foreground until interrupted.
    Start,
    Stop,
    Status,
}

#[derive(Subcommand, Debug)]
enum DisplayCommand {
    Time,
    Weather,
}

#[derive(Subcommand, Debug)]
enum LogsCommand {
    /// Drop every entry from the local journal.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();

    match cli.command {
        Command::Status => status(&settings).await,
        Command::Watch => watch(&settings).await,
        Command::Weather { command } => weather(&settings, command).await,
        Command::Exchange { command } => exchange(&settings, command).await,
        Command::Message { command } => message(&settings, command).await,
        Command::Led {
            speed,
            brightness,
            mode,
        } => {
            let client = rest_client(&settings).await?;
            client
                .apply_led_settings(&LedSettingsUpdate {
                    speed,
                    brightness,
                    mode,
                })
                .await?;
            println!("led settings applied");
            Ok(())
        }
        Command::Auto { command } => auto(&settings, command).await,
        Command::Display { command } => display(&settings, command).await,
        Command::Logs {
            limit,
            topic,
            local_only,
            command,
        } => logs(&settings, limit, topic.as_deref(), local_only, command).await,
        Command::Publish { topic, payload } => publish(&settings, &topic, &payload).await,
    }
}

async fn build_journal(settings: &Settings) -> Result<Arc<LogJournal>> {
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = SqliteStore::new(&database_url).await.map_err(|err| {
        error!(%database_url, %err, "failed to open the journal database");
        err
    })?;
    Ok(Arc::new(LogJournal::new(Arc::new(store))))
}

/// Client without a broker link, for commands that only talk REST.
async fn rest_client(settings: &Settings) -> Result<Arc<PanelClient>> {
    let journal = build_journal(settings).await?;
    PanelClient::new(settings, Arc::new(MissingBrokerLink::new()), journal)
}

/// Client with a live broker link and the event pump running.
async fn connected_client(settings: &Settings) -> Result<Arc<PanelClient>> {
    let journal = build_journal(settings).await?;
    let options = BrokerOptions {
        url: settings.broker_url.clone(),
        username: settings.broker_username.clone(),
        password: settings.broker_password.clone(),
        client_id_prefix: settings.client_id_prefix.clone(),
    };
    let link = MqttBrokerLink::connect(&options, Arc::clone(&journal)).await?;
    let client = PanelClient::new(settings, link, journal)?;
    client.spawn_event_pump().await;
    Ok(client)
}

async fn wait_for_link(client: &PanelClient, deadline: Duration) -> LinkStatus {
    let start = Instant::now();
    loop {
        let status = client.link_status();
        if status == LinkStatus::Connected || start.elapsed() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn status(settings: &Settings) -> Result<()> {
    let client = connected_client(settings).await?;

    println!("api:     {}", settings.api_base_url);
    match client.health().await {
        Ok(payload) => println!("backend: online ({payload})"),
        Err(err) => println!("backend: unreachable ({err})"),
    }

    println!("mqtt:    {}", settings.broker_url);
    let link = wait_for_link(&client, Duration::from_secs(5)).await;
    println!("broker:  {link}");

    let entries = client.journal().count().await?;
    println!("journal: {entries} entries");

    client.shutdown().await;
    Ok(())
}

async fn watch(settings: &Settings) -> Result<()> {
    let client = connected_client(settings).await?;
    client.spawn_health_poll().await;
    let mut events = client.subscribe_events();

    println!("watching panel events, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("... {skipped} events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn weather(settings: &Settings, command: WeatherCommand) -> Result<()> {
    let client = rest_client(settings).await?;

    match command {
        WeatherCommand::Current => match client.current_weather().await? {
            Some(snapshot) => print_weather(&snapshot),
            None => println!("no weather data yet"),
        },
        WeatherCommand::SetLocation { lat, lon } => {
            client.update_location(lat, lon).await?;
            println!("weather location set to {lat}, {lon}");
        }
        WeatherCommand::History { limit } => {
            for row in client.weather_history(limit).await? {
                print_weather(&row);
            }
        }
    }
    Ok(())
}

async fn exchange(settings: &Settings, command: ExchangeCommand) -> Result<()> {
    let client = rest_client(settings).await?;

    match command {
        ExchangeCommand::Current { pair } => {
            let pair: CurrencyPair = pair.parse()?;
            match client.current_exchange(&pair).await? {
                Some(snapshot) => print_exchange(&snapshot),
                None => println!("no rate for {pair} yet"),
            }
        }
        ExchangeCommand::Display { pair } => {
            let pair: CurrencyPair = pair.parse()?;
            client.display_exchange(&pair).await?;
            println!("{pair} pushed to the panel");
        }
        ExchangeCommand::History { limit } => {
            for row in client.exchange_history(limit).await? {
                print_exchange(&row);
            }
        }
    }
    Ok(())
}

async fn message(settings: &Settings, command: MessageCommand) -> Result<()> {
    let client = rest_client(settings).await?;

    match command {
        MessageCommand::Send { text, mode } => {
            client.send_message(&text, &mode).await?;
            println!("message sent");
        }
        MessageCommand::History { limit } => {
            for row in client.message_history(limit).await? {
                print_message(&row);
            }
        }
    }
    Ok(())
}

async fn auto(settings: &Settings, command: AutoCommand) -> Result<()> {
    match command {
        AutoCommand::Start => {
            let client = connected_client(settings).await?;
            client.auto_start().await?;
            println!("auto rotation running, press ctrl-c to stop");

            let mut events = client.subscribe_events();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(RecvError::Lagged(skipped)) => println!("... {skipped} events dropped"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            client.shutdown().await;
        }
        AutoCommand::Stop => {
            let client = rest_client(settings).await?;
            if client.auto_status().await.running {
                client.auto_stop().await;
                println!("auto rotation stopped");
            } else {
                println!("auto rotation is not running in this process");
            }
        }
        AutoCommand::Status => {
            let client = rest_client(settings).await?;
            let status = client.auto_status().await;
            println!(
                "running={} step={} slot={}",
                status.running, status.step, status.slot
            );
        }
    }
    Ok(())
}

async fn display(settings: &Settings, command: DisplayCommand) -> Result<()> {
    let client = rest_client(settings).await?;
    match command {
        DisplayCommand::Time => {
            client.trigger_time_display().await?;
            println!("time pushed to the panel");
        }
        DisplayCommand::Weather => {
            client.trigger_weather_display().await?;
            println!("weather pushed to the panel");
        }
    }
    Ok(())
}

async fn logs(
    settings: &Settings,
    limit: Option<usize>,
    topic: Option<&str>,
    local_only: bool,
    command: Option<LogsCommand>,
) -> Result<()> {
    let client = rest_client(settings).await?;

    if let Some(LogsCommand::Clear) = command {
        client.clear_local_logs().await?;
        println!("local journal cleared");
        return Ok(());
    }

    let entries = if local_only {
        client.journal().filtered(topic, limit.unwrap_or(100)).await?
    } else {
        let mut merged = client.aggregate_logs(topic).await?;
        if let Some(limit) = limit {
            merged.truncate(limit);
        }
        merged
    };

    if entries.is_empty() {
        println!("no log entries");
    }
    for entry in &entries {
        print_log_entry(entry);
    }
    Ok(())
}

async fn publish(settings: &Settings, topic: &str, payload: &str) -> Result<()> {
    let client = connected_client(settings).await?;

    let link = wait_for_link(&client, Duration::from_secs(10)).await;
    if link != LinkStatus::Connected {
        client.shutdown().await;
        anyhow::bail!("broker link is {link}, not connected");
    }

    client.publish(topic, payload).await?;
    println!("published to {topic}");

    client.shutdown().await;
    Ok(())
}

fn print_event(event: &PanelEvent) {
    match event {
        PanelEvent::LinkStatusChanged(status) => println!("[link] {status}"),
        PanelEvent::BrokerMessage { topic, payload } => println!("[{topic}] {payload}"),
        PanelEvent::ServerHealthChanged { online } => println!("[backend] online={online}"),
        PanelEvent::AutoStatusChanged(status) => println!(
            "[auto] running={} step={} slot={}",
            status.running, status.step, status.slot
        ),
        PanelEvent::Notice { text } => println!("[notice] {text}"),
    }
}

fn print_weather(snapshot: &WeatherSnapshot) {
    let when = snapshot.created_at.as_deref().unwrap_or("-");
    println!(
        "{when}  {:.1}C  {:.0}%  {:.0} hPa  {}",
        snapshot.temperature, snapshot.humidity, snapshot.pressure, snapshot.description
    );
}

fn print_exchange(snapshot: &ExchangeSnapshot) {
    let when = snapshot.created_at.as_deref().unwrap_or("-");
    println!(
        "{when}  {}/{}  {:.2}",
        snapshot.base_currency, snapshot.target_currency, snapshot.rate
    );
}

fn print_message(record: &MessageRecord) {
    let when = record.created_at.as_deref().unwrap_or("-");
    let mode = if record.mode.is_empty() {
        "-"
    } else {
        record.mode.as_str()
    };
    println!("{when}  {mode:<8}  {}", record.message);
}

fn print_log_entry(entry: &LogEntry) {
    println!(
        "{}  {:<6}  {:<8}  [{}] {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.source,
        entry.direction,
        entry.topic,
        entry.message
    );
}
