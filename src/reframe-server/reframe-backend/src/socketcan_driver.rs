// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Linux SocketCAN driver.
//!
//! Opens a raw CAN socket on a network interface such as `can0` or `vcan0`.
//! The interface bitrate is set by the OS (`ip link set can0 type can
//! bitrate ...`), so the configured bitrate is only logged. Reads block on a
//! worker thread with the socket read timeout set to the receive timeout.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use socketcan::{
    CanError, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, SocketOptions,
    StandardId,
};
use tracing::{debug, info, warn};

use reframe_core::channel::{OpenFuture, RecvFuture, SendFuture};
use reframe_core::{
    ChannelConfig, ChannelConnection, ChannelDriver, ChannelId, ChannelInfo, Frame, OpenError,
    RecvError, SendError,
};

const INTERFACE: &str = "socketcan";
const SYS_CLASS_NET: &str = "/sys/class/net";
/// `ARPHRD_CAN` as reported in `/sys/class/net/<if>/type`.
const ARPHRD_CAN: &str = "280";

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;
const ENOBUFS: i32 = 105;

#[derive(Debug, Default)]
pub struct SocketCanDriver;

impl SocketCanDriver {
    pub fn new() -> Self {
        Self
    }
}

fn open_error(ifname: &str, err: io::Error) -> OpenError {
    match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::NotFound, _) | (_, Some(ENODEV)) => {
            OpenError::DeviceNotFound(ifname.to_string())
        }
        (io::ErrorKind::PermissionDenied, _) => OpenError::PermissionDenied(ifname.to_string()),
        (_, Some(EBUSY)) => OpenError::Busy(ifname.to_string()),
        _ => OpenError::Io(format!("{}: {}", ifname, err)),
    }
}

fn to_socket_frame(frame: &Frame) -> Option<CanFrame> {
    let id = if frame.is_extended() {
        Id::Extended(ExtendedId::new(frame.id())?)
    } else {
        Id::Standard(StandardId::new(u16::try_from(frame.id()).ok()?)?)
    };
    CanFrame::new(id, frame.data())
}

fn from_socket_id(id: Id) -> (u32, bool) {
    match id {
        Id::Standard(id) => (u32::from(id.as_raw()), false),
        Id::Extended(id) => (id.as_raw(), true),
    }
}

fn list_can_interfaces(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| {
            std::fs::read_to_string(entry.path().join("type"))
                .map(|kind| kind.trim() == ARPHRD_CAN)
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

impl ChannelDriver for SocketCanDriver {
    fn open<'a>(&'a self, config: &'a ChannelConfig) -> OpenFuture<'a> {
        Box::pin(async move {
            let ifname = config.channel_id.channel.clone();
            let socket = CanSocket::open(&ifname).map_err(|e| open_error(&ifname, e))?;
            if let Err(e) = socket.set_error_filter_accept_all() {
                warn!("{}: cannot enable error frames, bus-off may go unnoticed: {}", ifname, e);
            }
            info!(
                "Opened SocketCAN interface {} (bitrate {} bit/s is set by the OS)",
                ifname, config.bitrate
            );
            Ok(Box::new(SocketCanConnection {
                channel_id: config.channel_id.clone(),
                socket: Some(Arc::new(socket)),
            }) as Box<dyn ChannelConnection>)
        })
    }

    fn discover(&self) -> Vec<ChannelInfo> {
        list_can_interfaces(Path::new(SYS_CLASS_NET))
            .into_iter()
            .map(|name| ChannelInfo {
                display_name: format!("SocketCAN {}", name),
                channel_id: ChannelId::new(INTERFACE, name),
            })
            .collect()
    }
}

pub struct SocketCanConnection {
    channel_id: ChannelId,
    socket: Option<Arc<CanSocket>>,
}

impl ChannelConnection for SocketCanConnection {
    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    fn receive<'a>(&'a mut self, timeout: Duration) -> RecvFuture<'a> {
        Box::pin(async move {
            let Some(socket) = self.socket.clone() else {
                return Err(RecvError::Io(format!("{} is closed", self.channel_id)));
            };
            socket
                .set_read_timeout(timeout)
                .map_err(|e| RecvError::Io(e.to_string()))?;
            let read = tokio::task::spawn_blocking(move || socket.read_frame())
                .await
                .map_err(|e| RecvError::Io(e.to_string()))?;

            match read {
                Ok(CanFrame::Data(frame)) => {
                    let (id, extended) = from_socket_id(frame.id());
                    Frame::with_format(id, extended, frame.data())
                        .map(Some)
                        .map_err(|e| RecvError::Io(e.to_string()))
                }
                Ok(CanFrame::Remote(_)) => Ok(None),
                Ok(CanFrame::Error(frame)) => match CanError::from(frame) {
                    CanError::BusOff => Err(RecvError::BusOff),
                    other => {
                        debug!("{}: bus error {}", self.channel_id, other);
                        Ok(None)
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    Ok(None)
                }
                Err(e) if e.raw_os_error() == Some(ENETDOWN) => Err(RecvError::BusOff),
                Err(e) => Err(RecvError::Io(e.to_string())),
            }
        })
    }

    fn send<'a>(&'a mut self, frame: &'a Frame) -> SendFuture<'a> {
        Box::pin(async move {
            let Some(socket) = self.socket.as_ref() else {
                return Err(SendError::Io(format!("{} is closed", self.channel_id)));
            };
            let outgoing = to_socket_frame(frame)
                .ok_or_else(|| SendError::Io(format!("cannot encode {}", frame)))?;
            socket.write_frame(&outgoing).map_err(|e| match e.raw_os_error() {
                Some(ENOBUFS) => SendError::BufferFull,
                Some(ENETDOWN) => SendError::BusOff,
                _ => SendError::Io(e.to_string()),
            })
        })
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed SocketCAN interface {}", self.channel_id.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let err = open_error("can9", io::Error::from_raw_os_error(ENODEV));
        assert_eq!(err, OpenError::DeviceNotFound("can9".to_string()));
        let err = open_error("can0", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err, OpenError::PermissionDenied("can0".to_string()));
        let err = open_error("can0", io::Error::from_raw_os_error(EBUSY));
        assert_eq!(err, OpenError::Busy("can0".to_string()));
    }

    #[test]
    fn test_frame_conversion_keeps_format() {
        let frame = Frame::with_format(0x100, true, &[1, 2]).unwrap();
        let socket_frame = to_socket_frame(&frame).unwrap();
        assert_eq!(from_socket_id(socket_frame.id()), (0x100, true));
        assert_eq!(socket_frame.data(), &[1, 2]);

        let frame = Frame::new(0x7FF, &[]).unwrap();
        let socket_frame = to_socket_frame(&frame).unwrap();
        assert_eq!(from_socket_id(socket_frame.id()), (0x7FF, false));
    }

    #[test]
    fn test_list_can_interfaces_filters_by_type() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for (name, kind) in [("can0", "280\n"), ("eth0", "1\n"), ("vcan0", "280\n")] {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("type"), kind).unwrap();
        }
        assert_eq!(list_can_interfaces(root), vec!["can0", "vcan0"]);
    }
}
