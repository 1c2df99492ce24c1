//! Terminal rendering of admin reports.

use std::fmt::Display;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::{Color, Style};
use penumbra::admin::VerifySeverity;
use penumbra::types::Hash;

/// Hex digits shown for a hash in painted listings.
const SHORT_HASH: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Theme {
    Auto,
    Light,
    Dark,
    Plain,
}

/// What a piece of output is; the theme decides how it looks.
#[derive(Clone, Copy)]
enum Tone {
    Title,
    Label,
    Hash,
    Good,
    Caution,
    Bad,
    Faint,
}

impl Tone {
    fn style(self, theme: Theme) -> Style {
        let light = theme == Theme::Light;
        match self {
            Tone::Title if light => Color::Blue.bold(),
            Tone::Title => Color::Purple.bold(),
            Tone::Label if light => Color::Black.bold(),
            Tone::Label => Color::LightBlue.normal(),
            Tone::Hash if light => Color::Cyan.normal(),
            Tone::Hash => Color::LightCyan.normal(),
            Tone::Good if light => Color::Green.bold(),
            Tone::Good => Color::LightGreen.bold(),
            Tone::Caution => Color::Yellow.bold(),
            Tone::Bad if light => Color::Red.bold(),
            Tone::Bad => Color::LightRed.bold(),
            Tone::Faint => Style::new().dimmed(),
        }
    }
}

pub struct Ui {
    theme: Theme,
    paint: bool,
    quiet: bool,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let paint = theme != Theme::Plain && std::io::stdout().is_terminal() && !quiet;

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        Self { theme, paint, quiet }
    }

    fn tone(&self, tone: Tone, text: impl Display) -> String {
        if self.paint {
            tone.style(self.theme).paint(text.to_string()).to_string()
        } else {
            text.to_string()
        }
    }

    fn title(&self, title: &str) {
        println!("{}", self.tone(Tone::Title, title));
    }

    /// A titled block of aligned `label value` rows.
    pub fn fields<K, V, I>(&self, title: &str, rows: I)
    where
        K: Display,
        V: Display,
        I: IntoIterator<Item = (K, V)>,
    {
        let rows: Vec<(String, String)> = rows
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.title(title);
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (label, value) in rows {
            println!("  {}  {value}", self.tone(Tone::Label, format!("{label:<width$}")));
        }
    }

    /// A titled listing with one line per record.
    pub fn records<I>(&self, title: &str, records: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.title(title);
        let mut empty = true;
        for record in records {
            empty = false;
            println!("  {record}");
        }
        if empty {
            println!("  {}", self.tone(Tone::Faint, "(none)"));
        }
    }

    /// A hash as listings show it. Painted output abbreviates; plain output
    /// keeps every digit so it can be pasted into other tools.
    pub fn hash(&self, hash: &Hash) -> String {
        let full = hash.to_string();
        if !self.paint {
            return full;
        }
        self.tone(Tone::Hash, full.get(..SHORT_HASH).unwrap_or(full.as_str()))
    }

    /// Labels a record as `tag` in the caution tone, e.g. `pending`.
    pub fn flag(&self, tag: &str) -> String {
        self.tone(Tone::Caution, tag)
    }

    /// One line stating whether an operation came out clean.
    pub fn verdict(&self, ok: bool, message: &str) {
        let mark = if ok {
            self.tone(Tone::Good, "ok")
        } else {
            self.tone(Tone::Bad, "FAILED")
        };
        println!("[{mark}] {message}");
    }

    pub fn finding(&self, severity: VerifySeverity, message: &str) {
        let (tone, tag) = match severity {
            VerifySeverity::Info => (Tone::Faint, "info"),
            VerifySeverity::Warning => (Tone::Caution, "warning"),
            VerifySeverity::Error => (Tone::Bad, "error"),
        };
        println!("  {} {message}", self.tone(tone, format!("{tag:<7}")));
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}: {message}", self.tone(Tone::Bad, "error"));
    }

    /// Starts a spinner for an operation that touches every registry entry.
    /// Nothing is drawn for plain or quiet output.
    pub fn spinner(&self, label: impl Into<String>) -> Spinner {
        let bar = (self.paint && !self.quiet).then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_message(label.into());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        Spinner {
            bar,
            start: Instant::now(),
        }
    }
}

pub struct Spinner {
    bar: Option<ProgressBar>,
    start: Instant,
}

impl Spinner {
    /// Clears the spinner and returns how long the operation took.
    pub fn stop(self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Renders a duration in the two coarsest units that apply: `850ms`,
/// `4.20s`, `12m05s`, `7h30m`, `3d04h`. Client idle times run to days.
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{}ms", duration.as_millis()),
        1..=59 => format!("{:.2}s", duration.as_secs_f64()),
        60..=3_599 => format!("{}m{:02}s", secs / 60, secs % 60),
        3_600..=86_399 => format!("{}h{:02}m", secs / 3_600, secs % 3_600 / 60),
        _ => format!("{}d{:02}h", secs / 86_400, secs % 86_400 / 3_600),
    }
}
