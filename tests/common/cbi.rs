use std::cmp::min;
use usb_device::control::Request;
use usbh_storage::host::{Data, TransferResult};
use usbh_storage::subclass::SUBCLASS_UFI;

use super::{nak, stall, Inner, Protocol, BULK_IN, BULK_OUT};

const ACCEPT_DEVICE_SPECIFIC_COMMAND: u8 = 0x00;

#[derive(Debug, Default)]
pub enum Phase {
    #[default]
    Idle,
    DataIn {
        data: Vec<u8>,
        offset: usize,
    },
    DataOut {
        lun: u8,
        cdb: Vec<u8>,
        received: Vec<u8>,
        expected: usize,
    },
    Done,
}

/// Device side of the Control/Bulk/Interrupt Transport
#[derive(Debug, Default)]
pub struct CbiDevice {
    pub phase: Phase,
    lun: u8,
    passed: bool,
}

pub fn is_reset(cdb: &[u8]) -> bool {
    cdb.len() >= 2 && cdb[0] == 0x1D && cdb[1] == 0x04
}

pub fn control(inner: &mut Inner, request: Request, data: Data<'_>) -> TransferResult {
    let Data::Out(cdb) = data else {
        return Err(stall());
    };
    if request.request != ACCEPT_DEVICE_SPECIFIC_COMMAND {
        return Err(stall());
    }

    inner.log.adsc_attempts += 1;
    if inner.faults.adsc_naks > 0 {
        inner.faults.adsc_naks -= 1;
        return Err(nak(0));
    }

    if is_reset(cdb) {
        inner.log.cbi_resets += 1;
        inner.cbi = CbiDevice {
            phase: Phase::Done,
            lun: 0,
            passed: true,
        };
        return Ok(cdb.len());
    }

    let lun = cdb[1] >> 5;
    inner.log.commands.push((lun, cdb[0]));

    let disk = inner.disk(lun);
    let expected = disk.data_out_len(cdb);
    if expected > 0 {
        inner.cbi = CbiDevice {
            phase: Phase::DataOut {
                lun,
                cdb: cdb.to_vec(),
                received: vec![],
                expected,
            },
            lun,
            passed: true,
        };
        return Ok(cdb.len());
    }

    let reply = disk.execute(cdb, &[]);
    inner.cbi = CbiDevice {
        phase: if reply.data.is_empty() {
            Phase::Done
        } else {
            Phase::DataIn {
                data: reply.data,
                offset: 0,
            }
        },
        lun,
        passed: reply.passed,
    };

    // without an interrupt endpoint failures are reported on the control pipe
    if !reply.passed && inner.protocol == Protocol::Cbi1 {
        return Err(stall());
    }
    Ok(cdb.len())
}

pub fn bulk(inner: &mut Inner, ep: u8, data: Data<'_>) -> TransferResult {
    match (ep, data) {
        (BULK_IN, Data::In(buf)) => {
            let Phase::DataIn { data, offset } = &mut inner.cbi.phase else {
                return Err(stall());
            };

            let available = data.len() - *offset;
            let (limit, naked) = match inner.faults.bulk_naks.pop_front() {
                Some(progress) => (min(progress, buf.len()), true),
                None => (buf.len(), false),
            };
            let count = min(limit, available);
            buf[..count].copy_from_slice(&data[*offset..*offset + count]);
            *offset += count;

            if naked {
                return Err(nak(count));
            }
            if *offset == data.len() {
                inner.cbi.phase = Phase::Done;
            }
            Ok(count)
        }
        (BULK_OUT, Data::Out(buf)) => {
            let Phase::DataOut {
                lun,
                cdb,
                received,
                expected,
            } = &mut inner.cbi.phase
            else {
                return Err(stall());
            };

            received.extend_from_slice(buf);
            if received.len() < *expected {
                return Ok(buf.len());
            }

            let (lun, cdb, received) = (*lun, cdb.clone(), std::mem::take(received));
            let reply = inner.disk(lun).execute(&cdb, &received);
            inner.cbi.passed = reply.passed;
            inner.cbi.phase = Phase::Done;
            if !reply.passed && inner.protocol == Protocol::Cbi1 {
                return Err(stall());
            }
            Ok(buf.len())
        }
        _ => Err(stall()),
    }
}

pub fn interrupt(inner: &mut Inner, buf: &mut [u8]) -> TransferResult {
    assert_eq!(2, buf.len());

    let status = match inner.faults.cbi_status.pop_front() {
        Some(status) => status,
        None if inner.interface.subclass == SUBCLASS_UFI => {
            let lun = inner.cbi.lun;
            let pending = inner.disk(lun).pending_sense();
            match pending {
                Some(sense) if !inner.cbi.passed => [sense.asc, sense.ascq],
                _ => [0x00, 0x00],
            }
        }
        None => [0x00, if inner.cbi.passed { 0x00 } else { 0x01 }],
    };

    buf.copy_from_slice(&status);
    inner.cbi.phase = Phase::Idle;
    Ok(2)
}
