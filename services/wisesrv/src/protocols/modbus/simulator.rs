//! Modbus TCP simulator
//!
//! In-memory coil server answering FC01 and FC05 like a WISE-4050. Used by
//! the integration tests and the `simulate` command. Faults can be injected
//! to exercise short reads, stalled devices and rejected writes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::codec::{encode_coils, parse_coil_value};
use super::constants::{
    coil_byte_count,
    EXCEPTION_FLAG, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_SLAVE_DEVICE_FAILURE, FC_READ_COILS,
    FC_WRITE_SINGLE_COIL, MAX_MBAP_LENGTH, MBAP_FULL_LEN, MODBUS_MAX_READ_COILS,
    MODBUS_PROTOCOL_ID,
};
use crate::error::Result;

/// MBAP header of a request as seen by the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    transaction_id: u16,
    unit_id: u8,
    /// PDU bytes following the header
    pdu_len: usize,
}

impl FrameHeader {
    /// None for a foreign protocol id or an impossible length
    fn decode(bytes: &[u8; MBAP_FULL_LEN]) -> Option<Self> {
        let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        if protocol_id != MODBUS_PROTOCOL_ID || length < 2 || length > MAX_MBAP_LENGTH {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            unit_id: bytes[6],
            pdu_len: length - 1,
        })
    }

    /// Response frame echoing this header around `pdu`
    fn frame(&self, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_FULL_LEN + pdu.len());
        frame.extend_from_slice(&self.transaction_id.to_be_bytes());
        frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu);
        frame
    }
}

/// Misbehaviour to inject into responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimulatorFault {
    #[default]
    None,
    /// FC01 answers carry no coil data
    ShortRead,
    /// Requests are read but never answered
    Stall,
    /// FC05 answers with exception 0x04
    WriteException,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicUsize,
    disconnects: AtomicUsize,
    requests: AtomicUsize,
}

/// Coil table shared by all connections
#[derive(Debug, Clone)]
pub struct ModbusSimulator {
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    coil_count: u16,
    fault: Arc<RwLock<SimulatorFault>>,
    counters: Arc<Counters>,
}

impl Default for ModbusSimulator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ModbusSimulator {
    /// Simulator exposing coil addresses `0..coil_count`, all OFF
    pub fn new(coil_count: u16) -> Self {
        Self {
            coils: Arc::new(RwLock::new(HashMap::new())),
            coil_count,
            fault: Arc::new(RwLock::new(SimulatorFault::None)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub async fn set_coil(&self, address: u16, on: bool) {
        self.coils.write().await.insert(address, on);
    }

    pub async fn coil(&self, address: u16) -> bool {
        self.coils.read().await.get(&address).copied().unwrap_or(false)
    }

    pub async fn set_fault(&self, fault: SimulatorFault) {
        *self.fault.write().await = fault;
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Connections that have ended
    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    /// Complete request frames received
    pub fn requests(&self) -> usize {
        self.counters.requests.load(Ordering::SeqCst)
    }

    /// Bind and serve in the background until the handle is stopped
    pub async fn start(&self, bind: &str) -> Result<SimulatorHandle> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus simulator listening on {}", local_addr);

        let token = CancellationToken::new();
        let sim = self.clone();
        let accept_token = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => {
                        debug!("Simulator accept loop stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("New connection from {}", peer);
                            sim.counters.connections.fetch_add(1, Ordering::SeqCst);
                            let sim = sim.clone();
                            let token = accept_token.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = token.cancelled() => {},
                                    result = sim.handle_connection(stream) => {
                                        if let Err(e) = result {
                                            debug!("Connection from {} ended: {}", peer, e);
                                        }
                                    }
                                }
                                sim.counters.disconnects.fetch_add(1, Ordering::SeqCst);
                            });
                        },
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break;
                        },
                    }
                }
            }
        });

        Ok(SimulatorHandle {
            local_addr,
            token,
            task,
        })
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header_buf = [0u8; MBAP_FULL_LEN];
            match stream.read_exact(&mut header_buf).await {
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let Some(header) = FrameHeader::decode(&header_buf) else {
                debug!("Dropping connection after malformed MBAP header");
                return Ok(());
            };
            let mut pdu = vec![0u8; header.pdu_len];
            stream.read_exact(&mut pdu).await?;
            self.counters.requests.fetch_add(1, Ordering::SeqCst);

            let fault = *self.fault.read().await;
            if fault == SimulatorFault::Stall {
                debug!("Stalling request {}", header.transaction_id);
                continue;
            }

            let response = self.respond(&pdu, fault).await;
            stream.write_all(&header.frame(&response)).await?;
        }
    }

    /// Response PDU for one request PDU
    async fn respond(&self, pdu: &[u8], fault: SimulatorFault) -> Vec<u8> {
        let Some(&fc) = pdu.first() else {
            return exception(0, EXCEPTION_ILLEGAL_FUNCTION);
        };
        if pdu.len() < 5 {
            return exception(fc, EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);

        match fc {
            FC_READ_COILS => self.read_coils(address, value, fault).await,
            FC_WRITE_SINGLE_COIL => self.write_single_coil(address, value, fault).await,
            _ => exception(fc, EXCEPTION_ILLEGAL_FUNCTION),
        }
    }

    async fn read_coils(&self, start: u16, quantity: u16, fault: SimulatorFault) -> Vec<u8> {
        if quantity == 0 || quantity as usize > MODBUS_MAX_READ_COILS {
            return exception(FC_READ_COILS, EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        if start as usize + quantity as usize > self.coil_count as usize {
            return exception(FC_READ_COILS, EXCEPTION_ILLEGAL_DATA_ADDRESS);
        }
        if fault == SimulatorFault::ShortRead {
            return vec![FC_READ_COILS, 0];
        }

        let coils = self.coils.read().await;
        let states: Vec<bool> = (start..start + quantity)
            .map(|addr| coils.get(&addr).copied().unwrap_or(false))
            .collect();
        let data = encode_coils(&states);
        let byte_count = coil_byte_count(quantity as usize);

        let mut response = Vec::with_capacity(2 + byte_count);
        response.push(FC_READ_COILS);
        response.push(byte_count as u8);
        response.extend_from_slice(&data);
        response
    }

    async fn write_single_coil(&self, address: u16, value: u16, fault: SimulatorFault) -> Vec<u8> {
        if address >= self.coil_count {
            return exception(FC_WRITE_SINGLE_COIL, EXCEPTION_ILLEGAL_DATA_ADDRESS);
        }
        let Some(on) = parse_coil_value(value) else {
            return exception(FC_WRITE_SINGLE_COIL, EXCEPTION_ILLEGAL_DATA_VALUE);
        };
        if fault == SimulatorFault::WriteException {
            return exception(FC_WRITE_SINGLE_COIL, EXCEPTION_SLAVE_DEVICE_FAILURE);
        }

        self.coils.write().await.insert(address, on);
        debug!("Coil {} set to {}", address, on);

        let mut response = vec![FC_WRITE_SINGLE_COIL];
        response.extend_from_slice(&address.to_be_bytes());
        response.extend_from_slice(&value.to_be_bytes());
        response
    }
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | EXCEPTION_FLAG, code]
}

/// Running simulator
#[derive(Debug)]
pub struct SimulatorHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop open connections and wait for the accept loop
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Simulator task failed: {}", e);
        }
    }
}
