/// bwfq live visualizer: attach to any running demo workload at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/bwfq_live.json every 200ms and renders a live TUI dashboard:
///
///   ┌ header: workload / status / busy queues ───────────────────┐
///   │ per-queue service shares   │ Stats: vtime, wsum, slots …   │
///   │ q/esc: quit  …footer…                                      │
///
/// Each queue row shows the share of service it has received next to the
/// share its weight entitles it to, so convergence to the fair split is
/// visible as the two numbers approach each other.
///
/// Press q or Esc to quit. The workload keeps running unaffected.
use bwfq::metrics::{LiveSnapshot, read_snapshot};
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
};
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let snapshot = read_snapshot();
        terminal.draw(|f| render(f, snapshot.as_ref()))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, snapshot: Option<&LiveSnapshot>) {
    let area = f.area();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // shares + stats
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, rows[0], snapshot);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_shares(f, cols[0], snapshot);
    render_stats(f, cols[1], snapshot);
    render_footer(f, rows[2]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, snapshot: Option<&LiveSnapshot>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚖ bwfq live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (workload, status, busy) = snapshot
        .map(|s| (s.workload.as_str(), s.status.as_str(), s.busy_queues))
        .unwrap_or(("—", "idle", 0));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  workload: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            workload,
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   busy queues: ", Style::default().fg(Color::DarkGray)),
        Span::styled(busy.to_string(), Style::default().fg(Color::Cyan)),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Per-queue service shares
// ---------------------------------------------------------------------------

fn render_shares(f: &mut Frame, area: Rect, snapshot: Option<&LiveSnapshot>) {
    let block = Block::default().title(" Service Shares ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(s) = snapshot.filter(|s| !s.queues.is_empty()) else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No workload running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start bwfq to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    // one label row + one gauge row per queue
    let mut constraints: Vec<Constraint> = Vec::new();
    for _ in &s.queues {
        constraints.push(Constraint::Length(1));
        constraints.push(Constraint::Length(1));
    }
    constraints.push(Constraint::Min(0));
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(inner);

    for (i, q) in s.queues.iter().enumerate() {
        let marker = if q.in_service {
            Span::styled("▶ ", Style::default().fg(Color::Green))
        } else if q.busy {
            Span::styled("● ", Style::default().fg(Color::Yellow))
        } else {
            Span::styled("○ ", Style::default().fg(Color::DarkGray))
        };
        let label = Line::from(vec![
            Span::raw(" "),
            marker,
            Span::styled(
                format!("{:<8}", q.name),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(" w={:<5}", q.weight),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(
                format!(" fair {:>5.1}%", q.fair_share_pct),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(
                format!("  start={} finish={}", q.start, q.finish),
                Style::default().fg(Color::DarkGray),
            ),
        ]);
        f.render_widget(Paragraph::new(label), rows[2 * i]);

        // green once the observed share has converged onto the fair share
        let converged = (q.share_pct - q.fair_share_pct).abs() < 1.0;
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(if converged {
                Color::Green
            } else {
                Color::Blue
            }))
            .percent(q.share_pct.clamp(0.0, 100.0) as u16)
            .label(format!("{:.1}% of {} units", q.share_pct, q.service_total));
        f.render_widget(gauge, rows[2 * i + 1]);
    }
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn render_stats(f: &mut Frame, area: Rect, snapshot: Option<&LiveSnapshot>) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // progress gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    match snapshot {
        None => {
            let msg = Paragraph::new(vec![
                Line::raw(""),
                Line::from(Span::styled(
                    "  Waiting for a snapshot…",
                    Style::default().fg(Color::DarkGray),
                )),
            ]);
            f.render_widget(msg, inner);
        }
        Some(s) => {
            let pct = if s.dispatches_total > 0 {
                ((s.dispatches as f64 / s.dispatches_total as f64) * 100.0) as u16
            } else {
                0
            };
            let gauge = Gauge::default()
                .block(Block::default().title("Slots"))
                .gauge_style(Style::default().fg(Color::Blue))
                .percent(pct.min(100))
                .label(format!("{} / {}", s.dispatches, s.dispatches_total));
            f.render_widget(gauge, rows[0]);

            let text = vec![
                Line::from(vec![
                    Span::styled("vtime:   ", Style::default().fg(Color::DarkGray)),
                    Span::raw(s.vtime.to_string()),
                ]),
                Line::from(vec![
                    Span::styled("wsum:    ", Style::default().fg(Color::DarkGray)),
                    Span::raw(s.wsum.to_string()),
                ]),
                Line::from(vec![
                    Span::styled("ticks:   ", Style::default().fg(Color::DarkGray)),
                    Span::raw(s.ticks.to_string()),
                ]),
                Line::from(vec![
                    Span::styled("queues:  ", Style::default().fg(Color::DarkGray)),
                    Span::raw(format!("{} busy", s.busy_queues)),
                ]),
            ];
            f.render_widget(Paragraph::new(text), rows[2]);
        }
    }
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        "  q / esc: quit    auto-refreshes every 200ms    reads /tmp/bwfq_live.json",
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
