use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tracing::{debug, warn};

use super::events::{EventEnvelope, EventNotice, Notification, NotificationBus};
use super::finality::FinalityTracker;
use super::types::TrackedEvent;
use crate::ledger::codec::CodecError;
use crate::ledger::{LogBatch, ProgramEvent};

const PROGRAM_PREFIX: &str = "Program ";
const PROGRAM_DATA_PREFIX: &str = "Program data: ";

#[derive(Debug, thiserror::Error)]
enum ParseError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error(transparent)]
	Codec(#[from] CodecError),
}

/// Extracts typed program events from transaction log lines.
#[derive(Debug, Clone)]
pub struct EventParser {
	program_id: String,
}

impl EventParser {
	pub fn new(program_id: impl Into<String>) -> Self {
		Self {
			program_id: program_id.into(),
		}
	}

	/// Decode every event emitted by the watched program, in log order.
	///
	/// Event data is only read while the watched program is the innermost invocation,
	/// so data logged by programs it calls into (or that call into it) is ignored.
	/// Lines that fail to decode are skipped with a warning.
	pub fn parse_logs(&self, logs: &[String]) -> Vec<ProgramEvent> {
		let mut invocations: Vec<&str> = Vec::new();
		let mut events = Vec::new();

		for (index, line) in logs.iter().enumerate() {
			if let Some(data) = line.strip_prefix(PROGRAM_DATA_PREFIX) {
				if invocations.last() != Some(&self.program_id.as_str()) {
					continue;
				}
				match decode_event(data) {
					Ok(event) => events.push(event),
					Err(e) => warn!(line = index, "Dropping malformed event data: {}", e),
				}
				continue;
			}

			let Some(rest) = line.strip_prefix(PROGRAM_PREFIX) else {
				continue;
			};
			let mut words = rest.split_whitespace();
			let (Some(program), Some(action)) = (words.next(), words.next()) else {
				continue;
			};
			if program.ends_with(':') {
				// "Program log:", "Program return:" and friends
				continue;
			}
			match action {
				"invoke" => invocations.push(program),
				"success" | "failed:" => {
					invocations.pop();
				}
				_ => {}
			}
		}

		events
	}
}

fn decode_event(data: &str) -> Result<ProgramEvent, ParseError> {
	let bytes = STANDARD.decode(data.trim())?;
	Ok(ProgramEvent::decode(&bytes)?)
}

/// Turns log batches into notifications and hands each event to the finality tracker.
pub struct EventDispatcher {
	parser: EventParser,
	bus: NotificationBus,
	tracker: FinalityTracker,
}

impl EventDispatcher {
	pub fn new(parser: EventParser, bus: NotificationBus, tracker: FinalityTracker) -> Self {
		Self {
			parser,
			bus,
			tracker,
		}
	}

	/// Dispatch the events of one transaction. Returns how many were dispatched.
	pub fn dispatch(&self, batch: &LogBatch) -> usize {
		let events = self.parser.parse_logs(&batch.logs);
		if events.is_empty() {
			debug!(signature = %batch.signature, "No program events in transaction");
			return 0;
		}

		let timestamp = Utc::now();
		let count = events.len();
		for event in events {
			let tracked = TrackedEvent::new(batch.signature.clone(), batch.slot, event, timestamp);
			debug!(
				signature = %tracked.signature,
				slot = tracked.slot,
				"Dispatching {}",
				tracked.event.name()
			);

			self.bus
				.emit(Notification::BlockchainEvent(EventEnvelope::from(&tracked)));
			self.bus
				.emit(Notification::ProgramEvent(EventNotice::from(&tracked)));
			self.tracker.track(tracked);
		}
		count
	}
}
