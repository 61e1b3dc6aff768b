//! Auto Encode Dashboard TUI
//!
//! Terminal interface for watching the encode queue and system load.
//! Connects to the daemon status endpoint at http://127.0.0.1:7979/status

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::{Duration, Instant},
};

const STATUS_URL: &str = "http://127.0.0.1:7979/status";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_FPS_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring daemon status types)
// ============================================================================

/// Read-only projection of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: u64,
    pub name: String,
    pub filename: String,
    pub status: String,
    pub build_step: String,
    pub paused: bool,
    pub error: bool,
    pub error_message: Option<String>,
    pub progress: u8,
    pub fps: Option<f64>,
    pub eta_secs: Option<u64>,
    pub elapsed_secs: u64,
    pub dual_layer: bool,
    pub complete: bool,
    pub created_at_ms: i64,
    pub completed_encode_ms: Option<i64>,
    pub completed_post_process_ms: Option<i64>,
}

/// System-level status for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot including jobs, system, and aggregate counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobSnapshot>,
    pub system: SystemStatus,
    pub queue_len: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub errored_jobs: usize,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            jobs: Vec::new(),
            system: SystemStatus::default(),
            queue_len: 0,
            processing_jobs: 0,
            completed_jobs: 0,
            errored_jobs: 0,
        }
    }
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the dashboard
pub struct App {
    /// Current status snapshot from the daemon
    pub status: Option<StatusSnapshot>,
    /// Event log with recent job transitions
    pub event_log: VecDeque<String>,
    /// Encode fps history for the chart (elapsed_secs, fps)
    pub fps_history: VecDeque<(f64, f64)>,
    /// Connection status
    pub connected: bool,
    /// HTTP client for status fetching
    client: reqwest::Client,
    /// Start time for the chart x-axis
    start_time: Instant,
}

impl App {
    /// Create a new App instance
    pub fn new() -> Self {
        Self {
            status: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            fps_history: VecDeque::with_capacity(MAX_FPS_POINTS),
            connected: false,
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Fetch the status snapshot from the daemon HTTP endpoint
    pub async fn fetch_status(&mut self) {
        match self.client.get(STATUS_URL).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<StatusSnapshot>().await {
                        Ok(snapshot) => {
                            self.note_transitions(&snapshot);
                            self.update_fps_history(&snapshot);
                            self.status = Some(snapshot);
                            self.connected = true;
                        }
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Log job lifecycle changes between two consecutive snapshots.
    /// The first snapshot after startup is taken silently.
    fn note_transitions(&mut self, next: &StatusSnapshot) {
        let events: Vec<String> = match self.status.as_ref() {
            None => Vec::new(),
            Some(prev) => {
                let mut events = Vec::new();
                for job in &next.jobs {
                    match prev.jobs.iter().find(|p| p.id == job.id) {
                        None => events.push(format!("{}: queued", job.name)),
                        Some(old) => {
                            if old.status != job.status {
                                events.push(format!(
                                    "{}: {} -> {}",
                                    job.name, old.status, job.status
                                ));
                            }
                            if !old.error && job.error {
                                let message =
                                    job.error_message.as_deref().unwrap_or("unknown error");
                                events.push(format!("{}: {}", job.name, message));
                            }
                        }
                    }
                }
                for old in &prev.jobs {
                    if !next.jobs.iter().any(|j| j.id == old.id) {
                        events.push(format!("{}: removed", old.name));
                    }
                }
                events
            }
        };

        for event in events {
            self.log_event(event);
        }
    }

    /// Append the active encode's fps to the chart history
    fn update_fps_history(&mut self, snapshot: &StatusSnapshot) {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let fps = snapshot
            .jobs
            .iter()
            .find(|j| j.status == "encoding")
            .and_then(|j| j.fps)
            .unwrap_or(0.0);

        if self.fps_history.len() >= MAX_FPS_POINTS {
            self.fps_history.pop_front();
        }
        self.fps_history.push_back((elapsed_secs, fps));
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the job table showing queue state
fn render_job_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["ID", "Name", "Status", "Step", "Progress", "FPS", "ETA", "Elapsed"]
        .iter()
        .map(|h| {
            Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
        });
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = if let Some(ref status) = app.status {
        status
            .jobs
            .iter()
            .map(|job| {
                let state = if job.error {
                    "error".to_string()
                } else if job.paused {
                    "paused".to_string()
                } else {
                    job.status.clone()
                };
                let step = if job.status == "building" {
                    job.build_step.clone()
                } else {
                    "-".to_string()
                };
                let fps = job.fps.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".into());
                let eta = job
                    .eta_secs
                    .map(format_duration)
                    .unwrap_or_else(|| "-".into());
                let elapsed = if job.elapsed_secs > 0 {
                    format_duration(job.elapsed_secs)
                } else {
                    "-".to_string()
                };

                let row = Row::new(vec![
                    Cell::from(job.id.to_string()),
                    Cell::from(job.name.clone()),
                    Cell::from(state),
                    Cell::from(step),
                    Cell::from(format!("{}%", job.progress)),
                    Cell::from(fps),
                    Cell::from(eta),
                    Cell::from(elapsed),
                ]);
                if job.error {
                    row.style(Style::default().fg(Color::Red))
                } else if job.complete {
                    row.style(Style::default().fg(Color::Green))
                } else {
                    row
                }
            })
            .collect()
    } else {
        vec![]
    };

    let widths = [
        Constraint::Length(4),
        Constraint::Min(20),
        Constraint::Length(15),
        Constraint::Length(14),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Length(9),
        Constraint::Length(9),
    ];

    let title = if app.connected {
        " Jobs "
    } else {
        " Jobs (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

/// Render CPU and memory usage gauges
fn render_system_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let (cpu_percent, mem_percent) = if let Some(ref status) = app.status {
        (
            status.system.cpu_usage_percent as f64 / 100.0,
            status.system.mem_usage_percent as f64 / 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu_percent * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}%", mem_percent * 100.0));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
}

/// Render load averages table
fn render_load_averages(f: &mut Frame, area: Rect, app: &App) {
    let (load_1, load_5, load_15) = if let Some(ref status) = app.status {
        (
            status.system.load_avg_1,
            status.system.load_avg_5,
            status.system.load_avg_15,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let rows = vec![
        Row::new(vec![Cell::from("1 min"), Cell::from(format!("{:.2}", load_1))]),
        Row::new(vec![Cell::from("5 min"), Cell::from(format!("{:.2}", load_5))]),
        Row::new(vec![
            Cell::from("15 min"),
            Cell::from(format!("{:.2}", load_15)),
        ]),
    ];

    let widths = [Constraint::Length(8), Constraint::Length(10)];

    let table =
        Table::new(rows, widths).block(Block::default().borders(Borders::ALL).title(" Load Avg "));

    f.render_widget(table, area);
}

/// Render the encode fps chart
fn render_fps_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.fps_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Encode FPS ");
        f.render_widget(block, area);
        return;
    }

    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("fps")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Encode FPS "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_x])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", max_x / 2.0)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("fps")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", max_y / 2.0)),
                    Span::raw(format!("{:.0}", max_y)),
                ]),
        );

    f.render_widget(chart, area);
}

/// Render event log showing recent job transitions
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Events "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with aggregate counts
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = if let Some(ref snapshot) = app.status {
        format!(
            " Queue: {} | Processing: {} | Completed: {} | Errored: {} | Press 'q' to quit ",
            snapshot.queue_len,
            snapshot.processing_jobs,
            snapshot.completed_jobs,
            snapshot.errored_jobs,
        )
    } else {
        " Connecting to daemon... | Press 'q' to quit ".to_string()
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // Main layout: status bar at bottom, rest for content
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Content area: left panel (jobs + events) and right panel (system + chart)
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(main_chunks[0]);

    // Left panel: job table on top, event log on bottom
    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(content_chunks[0]);

    // Right panel: gauges, load avg, and fps chart
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // CPU + Memory gauges
            Constraint::Length(5), // Load averages
            Constraint::Min(0),    // FPS chart
        ])
        .split(content_chunks[1]);

    render_job_table(f, left_chunks[0], app);
    render_event_log(f, left_chunks[1], app);
    render_system_gauges(f, right_chunks[0], app);
    render_load_averages(f, right_chunks[1], app);
    render_fps_chart(f, right_chunks[2], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let mut terminal = setup_terminal()?;

    let mut app = App::new();
    app.log_event("Auto Encode Dashboard started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    restore_terminal(&mut terminal)?;

    result
}

/// Main application loop
async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch = Instant::now() - poll_interval; // Fetch immediately on start

    loop {
        if last_fetch.elapsed() >= poll_interval {
            app.fetch_status().await;
            last_fetch = Instant::now();
        }

        terminal.draw(|f| ui(f, app))?;

        // Handle input with a short timeout to allow frequent redraws
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => {
                            return Ok(());
                        }
                        KeyCode::Esc => {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
