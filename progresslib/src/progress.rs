pub(crate) mod format;

use format::{BinarySize, HumanDuration};

use std::{
    collections::VecDeque,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    Result,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// Window over which the transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Moving average of progress units per second over a fixed window.
#[derive(Debug)]
pub struct ProgressSpeed {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressSpeed {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Record the current absolute position.
    pub fn record(&mut self, value: u64) {
        self.record_at(Instant::now(), value);
    }

    fn record_at(&mut self, now: Instant, value: u64) {
        self.samples.push_back((now, value));

        // Keep one sample older than the window so that the average always
        // spans the full window once enough data exists
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some((t, _)) if now.duration_since(*t) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn units_per_sec(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((t1, v1)), Some((t2, v2))) if t2 > t1 => {
                v2.saturating_sub(*v1) as f64 / t2.duration_since(*t1).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Redraw the same terminal line. Only usable when a single bar is active
    /// on an interactive terminal. Redraws at most 15 times per second.
    Interactive,
    /// Print a new line for every redraw. This is the only mode that stays
    /// readable when several bars share one terminal or when output goes to a
    /// log file. Redraws at most once every 5 seconds.
    Append,
    /// Do not draw anything.
    None,
}

impl ProgressDrawMode {
    fn default_interval(self) -> Duration {
        match self {
            Self::Interactive => Duration::from_millis(1000 / 15),
            Self::Append => Duration::from_secs(5),
            Self::None => Duration::ZERO,
        }
    }
}

/// Labelled byte progress bar. The label identifies the transfer (usually a
/// file name) so that lines from concurrent transfers can be told apart. The
/// total length may be unknown, in which case only the position and speed are
/// shown.
pub struct ProgressBar<T: Write + IsTty> {
    label: String,
    len: Option<u64>,
    pos: u64,
    term: T,
    mode: ProgressDrawMode,
    interval: Duration,
    started: Instant,
    last_draw: Option<Instant>,
    /// Position shown by the most recent draw
    drawn_pos: Option<u64>,
    speed: ProgressSpeed,
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Construct a new progress bar. The draw mode is picked based on whether
    /// `term` is a TTY. Nothing is drawn until the position changes.
    pub fn new(term: T, label: impl Into<String>, len: Option<u64>) -> Self {
        let mode = if term.is_tty() {
            ProgressDrawMode::Interactive
        } else {
            ProgressDrawMode::Append
        };

        Self {
            label: label.into(),
            len,
            pos: 0,
            term,
            mode,
            interval: mode.default_interval(),
            started: Instant::now(),
            last_draw: None,
            drawn_pos: None,
            speed: ProgressSpeed::new(SPEED_WINDOW),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode. If `None`, the mode is picked based on whether the
    /// terminal is a TTY. The redraw interval is reset to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| if self.term.is_tty() {
            ProgressDrawMode::Interactive
        } else {
            ProgressDrawMode::Append
        });
        self.interval = self.mode.default_interval();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Set the current position. This performs an immediate redraw.
    pub fn set_position(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        self.speed.record(pos);
        self.draw(true)
    }

    /// Advance the current position. The redraw is rate limited.
    pub fn advance(&mut self, delta: u64) -> Result<()> {
        self.pos = self.pos.saturating_add(delta);
        self.speed.record(self.pos);
        self.draw(false)
    }

    /// Draw the final state. In interactive mode, the bar is removed from the
    /// terminal. In append mode, a final line is printed if the last printed
    /// line is out of date. This is called automatically on drop.
    pub fn finish(&mut self) -> Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                if self.last_draw.is_some() {
                    self.term
                        .queue(Clear(ClearType::CurrentLine))?
                        .queue(MoveToColumn(0))?
                        .queue(Show)?
                        .flush()?;
                }
            }
            ProgressDrawMode::Append => {
                if self.drawn_pos != Some(self.pos) {
                    self.draw(true)?;
                }
            }
            ProgressDrawMode::None => {}
        }
        Ok(())
    }

    /// Reset the position, the elapsed time, and the speed.
    pub fn reset(&mut self) -> Result<()> {
        self.pos = 0;
        self.started = Instant::now();
        self.speed.reset();
        self.draw(true)
    }

    /// Draw the progress bar. Unless `force` is true, nothing is drawn if the
    /// previous draw happened less than one interval ago.
    pub fn draw(&mut self, force: bool) -> Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if !force {
            if let Some(t) = self.last_draw {
                if t.elapsed() < self.interval {
                    return Ok(());
                }
            }
        }

        let status = self.status();

        if self.mode == ProgressDrawMode::Interactive {
            let mut line = format!("{}: ", self.label);

            if let Some(ratio) = self.ratio() {
                let term_width = terminal::size().map(|s| s.0).unwrap_or(80) as usize;
                // Account for the separators around the bar
                let bar_width = term_width
                    .saturating_sub(line.len() + status.len() + 3);

                if bar_width > 0 {
                    let filled = (ratio * bar_width as f64).round() as usize;
                    line.push('[');
                    line.push_str(&"#".repeat(filled).cyan().to_string());
                    line.push_str(&"-".repeat(bar_width - filled.min(bar_width)).blue().to_string());
                    line.push_str("] ");
                }
            }

            line.push_str(&status);

            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Print(line))?;
        } else {
            self.term.queue(Print(format!("{}: {}\n", self.label, status)))?;
        }

        self.term.flush()?;

        self.last_draw = Some(Instant::now());
        self.drawn_pos = Some(self.pos);

        Ok(())
    }

    /// Completion ratio in `[0, 1]`, if the length is known.
    fn ratio(&self) -> Option<f64> {
        match self.len {
            Some(0) => Some(1.0),
            Some(len) => Some((self.pos as f64 / len as f64).clamp(0.0, 1.0)),
            None => None,
        }
    }

    fn status(&self) -> String {
        let speed = self.speed.units_per_sec();

        match (self.len, self.ratio()) {
            (Some(len), Some(ratio)) => {
                let eta = if speed > 0.0 {
                    Duration::from_secs_f64(len.saturating_sub(self.pos) as f64 / speed)
                } else {
                    Duration::ZERO
                };

                format!(
                    "{percent:.0}% {pos}/{len} ({speed}/s, ETA {eta})",
                    percent = ratio * 100.0,
                    pos = BinarySize(self.pos),
                    len = BinarySize(len),
                    speed = BinarySize(speed as u64),
                    eta = HumanDuration(eta),
                )
            }
            _ => format!(
                "{pos} ({speed}/s, {elapsed} elapsed)",
                pos = BinarySize(self.pos),
                speed = BinarySize(speed as u64),
                elapsed = HumanDuration(self.started.elapsed()),
            ),
        }
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
