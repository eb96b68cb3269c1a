/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 18/04/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::errors::{EngineError, Result};
use crate::particle::ParticleRecord;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// The collective operations the engine needs from its communicator. Every
/// rank must call the same operation in the same order; the particle
/// exchange doubles as the step barrier. Gathers deliver to rank zero only.
pub trait Transport {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// All-to-all on per-destination counts: entry r of the result is the
    /// number of records rank r is about to send here.
    fn exchange_counts(&mut self, send_counts: &[u32]) -> Result<Vec<u32>>;
    /// All-to-all-variable on particle records. Arrivals are concatenated
    /// in source-rank order, which keeps ingestion deterministic.
    fn exchange_particles(&mut self, buckets: Vec<Vec<ParticleRecord>>) -> Result<Vec<ParticleRecord>>;
    /// Concatenates per-rank slices at rank zero, in rank order.
    fn gather_f64(&mut self, local: &[f64]) -> Result<Option<Vec<f64>>>;
    fn gather_records(&mut self, local: &[ParticleRecord]) -> Result<Option<Vec<ParticleRecord>>>;

    /// Collective OR over a per-rank flag, built on the count exchange so
    /// every rank leaves with the same answer. Used to agree on shutdown.
    fn agree(&mut self, local: bool) -> Result<bool> {
        let flag = if local { 1u32 } else { 0u32 };
        let send = vec![flag; self.size()];
        let recv = self.exchange_counts(&send)?;
        Ok(recv.iter().any(|c| *c > 0))
    }
}

/// The single-rank communicator: every collective is the identity.
pub struct SerialTransport;

impl Transport for SerialTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange_counts(&mut self, send_counts: &[u32]) -> Result<Vec<u32>> {
        Ok(send_counts.to_vec())
    }

    fn exchange_particles(&mut self, mut buckets: Vec<Vec<ParticleRecord>>) -> Result<Vec<ParticleRecord>> {
        Ok(buckets.swap_remove(0))
    }

    fn gather_f64(&mut self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        Ok(Some(local.to_vec()))
    }

    fn gather_records(&mut self, local: &[ParticleRecord]) -> Result<Option<Vec<ParticleRecord>>> {
        Ok(Some(local.to_vec()))
    }
}

enum Message {
    Counts(usize, u32),
    Records(usize, Vec<ParticleRecord>),
    Field(usize, Vec<f64>),
}

/// A communicator over in-process rank threads: a full mesh of channels plus
/// a shared barrier that closes every collective. This is both the engine's
/// multi-rank execution path and the harness that drives exchange tests on
/// one process; an MPI-backed implementation would slot in behind the same
/// trait.
pub struct ChannelTransport {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Message>>,
    receiver: Receiver<Message>,
    barrier: Arc<Barrier>,
}

impl ChannelTransport {
    /// Builds one connected transport per rank.
    pub fn create(size: usize) -> Vec<ChannelTransport> {
        let mut senders: Vec<Sender<Message>> = Vec::with_capacity(size);
        let mut receivers: Vec<Receiver<Message>> = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(size));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ChannelTransport {
                rank: rank,
                size: size,
                senders: senders.clone(),
                receiver: receiver,
                barrier: barrier.clone(),
            })
            .collect()
    }

    fn send(&self, dest: usize, message: Message) -> Result<()> {
        self.senders[dest]
            .send(message)
            .map_err(|_| EngineError::TransportError(format!("rank {} is unreachable", dest)))
    }

    fn recv(&self) -> Result<Message> {
        self.receiver
            .recv()
            .map_err(|_| EngineError::TransportError("a peer rank disconnected".to_string()))
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange_counts(&mut self, send_counts: &[u32]) -> Result<Vec<u32>> {
        if send_counts.len() != self.size {
            return Err(EngineError::TransportError(format!(
                "expected {} per-destination counts, got {}",
                self.size,
                send_counts.len()
            )));
        }
        for dest in 0..self.size {
            self.send(dest, Message::Counts(self.rank, send_counts[dest]))?;
        }
        let mut recv_counts = vec![0u32; self.size];
        for _ in 0..self.size {
            match self.recv()? {
                Message::Counts(src, count) => recv_counts[src] = count,
                _ => {
                    return Err(EngineError::TransportError(
                        "unexpected message during count exchange".to_string(),
                    ))
                }
            }
        }
        self.barrier.wait();
        Ok(recv_counts)
    }

    fn exchange_particles(&mut self, buckets: Vec<Vec<ParticleRecord>>) -> Result<Vec<ParticleRecord>> {
        if buckets.len() != self.size {
            return Err(EngineError::TransportError(format!(
                "expected {} destination buckets, got {}",
                self.size,
                buckets.len()
            )));
        }
        for (dest, bucket) in buckets.into_iter().enumerate() {
            self.send(dest, Message::Records(self.rank, bucket))?;
        }
        let mut slots: Vec<Option<Vec<ParticleRecord>>> = (0..self.size).map(|_| None).collect();
        for _ in 0..self.size {
            match self.recv()? {
                Message::Records(src, records) => slots[src] = Some(records),
                _ => {
                    return Err(EngineError::TransportError(
                        "unexpected message during particle exchange".to_string(),
                    ))
                }
            }
        }
        self.barrier.wait();
        let mut arrivals: Vec<ParticleRecord> = vec![];
        for slot in slots {
            arrivals.extend(slot.expect("every rank contributes one bucket"));
        }
        Ok(arrivals)
    }

    fn gather_f64(&mut self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        if self.rank == 0 {
            let mut slots: Vec<Option<Vec<f64>>> = (0..self.size).map(|_| None).collect();
            slots[0] = Some(local.to_vec());
            for _ in 1..self.size {
                match self.recv()? {
                    Message::Field(src, values) => slots[src] = Some(values),
                    _ => {
                        return Err(EngineError::TransportError(
                            "unexpected message during field gather".to_string(),
                        ))
                    }
                }
            }
            self.barrier.wait();
            let mut gathered: Vec<f64> = vec![];
            for slot in slots {
                gathered.extend(slot.expect("every rank contributes one slice"));
            }
            Ok(Some(gathered))
        } else {
            self.send(0, Message::Field(self.rank, local.to_vec()))?;
            self.barrier.wait();
            Ok(None)
        }
    }

    fn gather_records(&mut self, local: &[ParticleRecord]) -> Result<Option<Vec<ParticleRecord>>> {
        if self.rank == 0 {
            let mut slots: Vec<Option<Vec<ParticleRecord>>> = (0..self.size).map(|_| None).collect();
            slots[0] = Some(local.to_vec());
            for _ in 1..self.size {
                match self.recv()? {
                    Message::Records(src, records) => slots[src] = Some(records),
                    _ => {
                        return Err(EngineError::TransportError(
                            "unexpected message during record gather".to_string(),
                        ))
                    }
                }
            }
            self.barrier.wait();
            let mut gathered: Vec<ParticleRecord> = vec![];
            for slot in slots {
                gathered.extend(slot.expect("every rank contributes one slice"));
            }
            Ok(Some(gathered))
        } else {
            self.send(0, Message::Records(self.rank, local.to_vec()))?;
            self.barrier.wait();
            Ok(None)
        }
    }
}
