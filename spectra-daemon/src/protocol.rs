use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use spectra_core::types::SINGLE_FREQUENCY_CYCLE_MS;
use spectra_core::{
    ErrorKind, EventEnvelope, Frequency, FrequencyUnit, SweepConfiguration, SweepLimits,
    ValidationError,
};
use spectra_grid::{PerformanceSample, Viewport};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::reconcile::ClientView;

/// JSON newline-delimited request, tagged by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Start(StartRequest),
    Stop,
    EmergencyStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ForceCleanup,
    Health,
    CycleStatus,
    Reconcile {
        view: ClientView,
    },
    /// Turns the connection into an event stream.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        view: Option<ClientView>,
    },
    GridSnapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewport: Option<Viewport>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
    },
    SetProfile {
        name: String,
    },
    ListProfiles,
    GridCell {
        id: String,
    },
    GridExport,
    ReportPerformance(PerformanceSample),
    SuggestProfile {
        viewport: Viewport,
    },
    DeviceReset,
    /// Stop the daemon itself.
    Shutdown,
}

/// Either a bare number in the request's unit or a full `{value, unit}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrequencyInput {
    Value(f64),
    Full(Frequency),
}

impl FrequencyInput {
    fn resolve(self, unit: FrequencyUnit) -> Frequency {
        match self {
            FrequencyInput::Value(value) => Frequency::new(value, unit),
            FrequencyInput::Full(frequency) => frequency,
        }
    }
}

/// Start request: a frequency list with cycle time, or the single
/// `frequency` field older clients send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frequencies: Vec<FrequencyInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<FrequencyInput>,
    #[serde(default)]
    pub unit: FrequencyUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time_ms: Option<u64>,
}

impl StartRequest {
    pub fn into_configuration(
        self,
        limits: &SweepLimits,
    ) -> Result<SweepConfiguration, ValidationError> {
        let unit = self.unit;
        let mut frequencies: Vec<Frequency> = self
            .frequencies
            .into_iter()
            .map(|f| f.resolve(unit))
            .collect();
        if frequencies.is_empty() {
            frequencies.extend(self.frequency.map(|f| f.resolve(unit)));
        }
        match self.cycle_time_ms {
            Some(ms) => SweepConfiguration::new(frequencies, Duration::from_millis(ms), limits),
            None if frequencies.len() == 1 => SweepConfiguration::single(frequencies[0], limits),
            None => SweepConfiguration::new(
                frequencies,
                Duration::from_millis(SINGLE_FREQUENCY_CYCLE_MS),
                limits,
            ),
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
            hint: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            kind: Some(kind),
            hint: Some(kind.hint().to_string()),
        }
    }
}

impl From<&DaemonError> for DaemonResponse {
    fn from(err: &DaemonError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind()),
            hint: Some(err.hint()),
        }
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }
    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    home: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

fn read_response(reader: &mut impl BufRead, home: &Path) -> Result<DaemonResponse, DaemonError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket_path(home), e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;
    read_response(&mut BufReader::new(stream), home)
}

/// Send a request and unwrap its payload; `ok: false` becomes
/// [`DaemonError::Rejected`].
pub fn request(home: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, request)?)
}

/// Health check, retried briefly so it also works right after `daemon start`.
pub fn request_health(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &DaemonRequest::Health) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon health retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_shutdown(home: &Path) -> Result<(), DaemonError> {
    request(home, &DaemonRequest::Shutdown).map(|_| ())
}

pub fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let kind = response.kind.unwrap_or(ErrorKind::Internal);
    Err(DaemonError::Rejected {
        kind,
        message: response
            .error
            .unwrap_or_else(|| "unknown daemon error".to_string()),
        hint: response.hint.unwrap_or_else(|| kind.hint().to_string()),
    })
}

/// Blocking reader over a `subscribe` connection.
pub struct EventStream {
    reader: BufReader<UnixStream>,
    pending: Vec<u8>,
    /// Payload of the subscribe acknowledgement.
    pub ack: Value,
}

impl EventStream {
    pub fn connect(home: &Path, view: Option<ClientView>) -> Result<Self, DaemonError> {
        let mut stream = connect(home)?;
        write_request(&mut stream, home, &DaemonRequest::Subscribe { view })?;
        let mut reader = BufReader::new(stream);
        let ack = response_into_data(read_response(&mut reader, home)?)?;
        Ok(Self {
            reader,
            pending: Vec::new(),
            ack,
        })
    }

    /// Next event, or `Ok(None)` when nothing arrived within `timeout`.
    /// A closed connection is [`DaemonError::ChannelClosed`].
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<EventEnvelope>, DaemonError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| io_err("daemon event stream", e))?;
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(DaemonError::ChannelClosed("daemon event stream")),
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let line = std::mem::take(&mut self.pending);
                    let text = String::from_utf8_lossy(&line);
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(serde_json::from_str(text.trim_end())?));
                }
                Ok(_) => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_err("daemon event stream", err)),
            }
        }
    }
}
