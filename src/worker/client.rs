//! Host-side adapter for the worker channel.
//!
//! `WorkerClient` turns each [`WorkerApi`] call into one request line and reads
//! the matching response. A structured error in the response comes back as
//! `BridgeError::Domain` with the same variant the backend raised, so callers
//! see the same error they would get from an in-process call.
//!
//! Any transport or protocol failure leaves the channel in an unknown
//! position, so the client marks itself desynchronized and refuses further
//! calls. The pool then throws the whole context away.

use super::api::WorkerApi;
use super::ipc::{LineReader, LineWriter, split_stream};
use super::protocol::{ScanEvent, WorkRequest, WorkResponse};
use crate::error::{BridgeError, DomainError, Result};
use crate::types::{
    DeviceConfig, EmailMessage, ImageData, MailResult, ScanDevice, ScanOptions, WindowHandle,
};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::trace;

/// Client stub bound to one worker's channel.
pub struct WorkerClient {
    pid: u32,
    reader: LineReader<UnixStream>,
    writer: LineWriter<UnixStream>,
    desynced: bool,
}

impl WorkerClient {
    /// Connect to a worker's channel socket.
    ///
    /// A missing socket or a refused connection means the worker is not
    /// listening yet and is reported as `EndpointNotReady`.
    pub fn connect(path: &Path, pid: u32, call_timeout: Option<Duration>) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                BridgeError::EndpointNotReady(format!("{}: {}", path.display(), e))
            }
            _ => BridgeError::Transport(format!(
                "Failed to connect to worker {} at {}: {}",
                pid,
                path.display(),
                e
            )),
        })?;
        stream.set_read_timeout(call_timeout)?;
        Self::from_stream(stream, pid)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream, pid: u32) -> Result<Self> {
        let (reader, writer) = split_stream(stream)?;
        Ok(Self {
            pid,
            reader,
            writer,
            desynced: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once a call failed at the transport level or a scan stream was
    /// abandoned before its end.
    pub fn is_usable(&self) -> bool {
        !self.desynced
    }

    /// Start a scan and return its event stream.
    ///
    /// The stream yields events until the worker reports the end of the scan,
    /// yields a single `Err` if the scan fails, and then stops. Dropping the
    /// stream early leaves unread events on the channel and makes this client
    /// unusable.
    pub fn scan_stream(&mut self, options: &ScanOptions) -> Result<ScanStream<'_>> {
        self.send(&WorkRequest::Scan {
            options: options.clone(),
        })?;
        Ok(ScanStream {
            client: self,
            finished: false,
        })
    }

    /// Ask the worker to exit after acknowledging, waiting at most `timeout`
    /// for the reply.
    pub fn stop_worker(&mut self, timeout: Duration) -> Result<()> {
        // Both halves share one socket, so this bounds the send as well
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        let socket = self.reader.get_ref();
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;
        match self.call(&WorkRequest::Stop)? {
            WorkResponse::Stopped => Ok(()),
            other => Err(self.unexpected("stop", other)),
        }
    }

    fn send(&mut self, request: &WorkRequest) -> Result<()> {
        if self.desynced {
            return Err(BridgeError::Transport(format!(
                "Channel to worker {} is no longer usable",
                self.pid
            )));
        }
        trace!(worker_pid = self.pid, op = request.name(), "Sending request");
        self.writer.write_line(&request.to_line()).map_err(|e| {
            self.desynced = true;
            BridgeError::Transport(format!("Failed to send to worker {}: {}", self.pid, e))
        })
    }

    fn recv(&mut self) -> Result<WorkResponse> {
        let line = match self.reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.desynced = true;
                return Err(BridgeError::Transport(format!(
                    "Worker {} closed the channel",
                    self.pid
                )));
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.desynced = true;
                return Err(BridgeError::Transport(format!(
                    "Timed out waiting for worker {}",
                    self.pid
                )));
            }
            Err(e) => {
                self.desynced = true;
                return Err(BridgeError::Transport(format!(
                    "Failed to receive from worker {}: {}",
                    self.pid, e
                )));
            }
        };
        match WorkResponse::from_line(line) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.desynced = true;
                Err(BridgeError::ProtocolViolation(format!(
                    "Invalid response from worker {}: {}",
                    self.pid, e
                )))
            }
        }
    }

    /// Send a unary request and read its response, surfacing a carried error.
    fn call(&mut self, request: &WorkRequest) -> Result<WorkResponse> {
        self.send(request)?;
        match self.recv()? {
            WorkResponse::Error { error } => Err(DomainError::from(error).into()),
            response => Ok(response),
        }
    }

    fn unexpected(&mut self, op: &str, response: WorkResponse) -> BridgeError {
        self.desynced = true;
        BridgeError::ProtocolViolation(format!(
            "Worker {} sent unexpected response to {}: {:?}",
            self.pid, op, response
        ))
    }
}

impl WorkerApi for WorkerClient {
    fn init(&mut self, staging_path: Option<&Path>) -> Result<()> {
        let request = WorkRequest::Init {
            staging_path: staging_path.map(Path::to_path_buf),
        };
        match self.call(&request)? {
            WorkResponse::Initialized => Ok(()),
            other => Err(self.unexpected("init", other)),
        }
    }

    fn get_device_list(&mut self, options: &ScanOptions) -> Result<Vec<ScanDevice>> {
        let request = WorkRequest::GetDeviceList {
            options: options.clone(),
        };
        match self.call(&request)? {
            WorkResponse::DeviceList { devices } => Ok(devices),
            other => Err(self.unexpected("get_device_list", other)),
        }
    }

    fn scan(&mut self, options: &ScanOptions, on_event: &mut dyn FnMut(ScanEvent)) -> Result<()> {
        for event in self.scan_stream(options)? {
            on_event(event?);
        }
        Ok(())
    }

    fn send_mail(&mut self, message: &EmailMessage) -> Result<MailResult> {
        let request = WorkRequest::SendMail {
            message: message.clone(),
        };
        match self.call(&request)? {
            WorkResponse::MailSent { result } => Ok(result),
            other => Err(self.unexpected("send_mail", other)),
        }
    }

    fn can_load_mail(&mut self, client_name: Option<&str>) -> Result<bool> {
        let request = WorkRequest::CanLoadMail {
            client_name: client_name.map(str::to_string),
        };
        match self.call(&request)? {
            WorkResponse::MailAvailability { loaded } => Ok(loaded),
            other => Err(self.unexpected("can_load_mail", other)),
        }
    }

    fn render_thumbnail(&mut self, image: &ImageData, size: u32) -> Result<Vec<u8>> {
        let request = WorkRequest::RenderThumbnail {
            image: image.clone(),
            size,
        };
        match self.call(&request)? {
            WorkResponse::Thumbnail { bytes } => Ok(bytes),
            other => Err(self.unexpected("render_thumbnail", other)),
        }
    }

    fn render_pdf(&mut self, path: &Path, dpi: f32) -> Result<Vec<u8>> {
        let request = WorkRequest::RenderPdf {
            path: path.to_path_buf(),
            dpi,
        };
        match self.call(&request)? {
            WorkResponse::PdfPage { bytes } => Ok(bytes),
            other => Err(self.unexpected("render_pdf", other)),
        }
    }

    fn native_device_ui(
        &mut self,
        device_id: &str,
        window: WindowHandle,
    ) -> Result<Option<DeviceConfig>> {
        let request = WorkRequest::NativeDeviceUi {
            device_id: device_id.to_string(),
            window,
        };
        match self.call(&request)? {
            WorkResponse::NativeUi { config } => Ok(config),
            other => Err(self.unexpected("native_device_ui", other)),
        }
    }
}

/// Events of one scan, read lazily from the channel.
pub struct ScanStream<'a> {
    client: &'a mut WorkerClient,
    finished: bool,
}

impl Iterator for ScanStream<'_> {
    type Item = Result<ScanEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = match self.client.recv() {
            Ok(WorkResponse::ScanEvent { event }) => return Some(Ok(event)),
            Ok(WorkResponse::ScanComplete) => None,
            Ok(WorkResponse::Error { error }) => Some(Err(DomainError::from(error).into())),
            Ok(other) => Some(Err(self.client.unexpected("scan", other))),
            Err(e) => Some(Err(e)),
        };
        self.finished = true;
        item
    }
}

impl Drop for ScanStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.client.desynced = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::RemoteError;
    use crate::error::ErrorKind;

    /// A client wired to a scripted peer that answers each request line with
    /// the given responses.
    fn scripted(responses: Vec<Vec<WorkResponse>>) -> (WorkerClient, std::thread::JoinHandle<()>) {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut reader, mut writer) = split_stream(server_end).unwrap();
            for batch in responses {
                if reader.read_line().unwrap().is_none() {
                    return;
                }
                for response in batch {
                    writer.write_line(&response.to_line()).unwrap();
                }
            }
        });
        (WorkerClient::from_stream(client_end, 7).unwrap(), handle)
    }

    #[test]
    fn test_device_list_call() {
        let devices = vec![ScanDevice::new("a", "A", Default::default())];
        let (mut client, peer) = scripted(vec![vec![WorkResponse::DeviceList {
            devices: devices.clone(),
        }]]);

        assert_eq!(
            client.get_device_list(&ScanOptions::default()).unwrap(),
            devices
        );
        assert!(client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_carried_error_becomes_domain_error() {
        let (mut client, peer) = scripted(vec![vec![WorkResponse::Error {
            error: RemoteError {
                kind: ErrorKind::DeviceOffline,
                message: "unplugged".into(),
            },
        }]]);

        let err = client.get_device_list(&ScanOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Domain(DomainError::DeviceOffline(ref m)) if m == "unplugged"
        ));
        // A domain error is a clean response; the channel stays usable
        assert!(client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_wrong_response_is_protocol_violation() {
        let (mut client, peer) = scripted(vec![vec![WorkResponse::Stopped]]);
        let err = client.init(None).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolViolation(_)));
        assert!(!client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_eof_is_transport_error() {
        // Peer hangs up without reading anything
        let (mut client, peer) = scripted(vec![]);
        peer.join().unwrap();

        let err = client.can_load_mail(None).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!client.is_usable());

        let err = client.can_load_mail(None).unwrap_err();
        assert!(err.to_string().contains("no longer usable"));
    }

    #[test]
    fn test_scan_stream_until_complete() {
        let (mut client, peer) = scripted(vec![vec![
            WorkResponse::event(ScanEvent::PageStart),
            WorkResponse::event(ScanEvent::Progress { value: 0.5 }),
            WorkResponse::ScanComplete,
        ]]);

        let events: Vec<_> = client
            .scan_stream(&ScanOptions::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            events,
            vec![ScanEvent::PageStart, ScanEvent::Progress { value: 0.5 }]
        );
        assert!(client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_scan_stream_error_is_last_item() {
        let (mut client, peer) = scripted(vec![vec![
            WorkResponse::event(ScanEvent::PageStart),
            WorkResponse::error(&DomainError::PaperJam("tray".into())),
        ]]);

        let mut stream = client.scan_stream(&ScanOptions::default()).unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), ScanEvent::PageStart);
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Domain(DomainError::PaperJam(_))));
        assert!(stream.next().is_none());
        drop(stream);
        assert!(client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_abandoned_stream_desyncs_client() {
        let (mut client, peer) = scripted(vec![vec![
            WorkResponse::event(ScanEvent::PageStart),
            WorkResponse::event(ScanEvent::PageStart),
            WorkResponse::ScanComplete,
        ]]);

        {
            let mut stream = client.scan_stream(&ScanOptions::default()).unwrap();
            stream.next();
        }
        assert!(!client.is_usable());
        peer.join().unwrap();
    }

    #[test]
    fn test_call_timeout() {
        let (client_end, _server_end) = UnixStream::pair().unwrap();
        client_end
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut client = WorkerClient::from_stream(client_end, 9).unwrap();

        let err = client.init(None).unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        assert!(!client.is_usable());
    }

    #[test]
    fn test_stop_gives_up_on_silent_worker() {
        let (client_end, _server_end) = UnixStream::pair().unwrap();
        let mut client = WorkerClient::from_stream(client_end, 11).unwrap();

        let started = std::time::Instant::now();
        let err = client.stop_worker(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!client.is_usable());
    }

    #[test]
    fn test_stop_acknowledged() {
        let (mut client, peer) = scripted(vec![vec![WorkResponse::Stopped]]);
        client.stop_worker(Duration::from_secs(5)).unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_connect_to_missing_socket_is_endpoint_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let result = WorkerClient::connect(&dir.path().join("absent.sock"), 1, None);
        assert!(matches!(result, Err(BridgeError::EndpointNotReady(_))));
    }
}
