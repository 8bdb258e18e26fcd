//! Execution Timeline
//!
//! Tracks when each step started, finished, failed or was skipped, for the
//! summary printed at the end of a run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step was dispatched
    Started,
    /// Step was aggregated with at least one passing sample
    Completed,
    /// Step was already finished in an earlier run
    Skipped,
    /// Every sample failed, or waiting for the batch failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Flag of the step
    pub flag: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, flag: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            flag: flag.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns step durations in milliseconds, for dispatched steps.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();

            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.flag, elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(event.flag.as_str()) {
                        durations.insert(event.flag.clone(), elapsed - start);
                    }
                }
                EventType::Skipped => {}
            }
        }

        durations
    }

    /// One line per step in the order the steps were reached.
    pub fn summary(&self) -> String {
        let durations = self.get_durations();
        let mut output = String::from("\nExecution Timeline:\n\n");

        for event in &self.events {
            let status = match event.event_type {
                EventType::Started => continue,
                EventType::Completed => "done",
                EventType::Skipped => "skipped",
                EventType::Failed => "FAILED",
            };

            let duration = durations
                .get(&event.flag)
                .filter(|_| event.event_type != EventType::Skipped)
                .map(|ms| format!("{} ms", ms))
                .unwrap_or_else(|| "-".to_string());

            output.push_str(&format!(
                "{:30} {:8} {}\n",
                truncate(&event.flag, 30),
                status,
                duration
            ));
        }

        output.push_str(&format!("\nTotal: {:.2?}\n", self.elapsed()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
