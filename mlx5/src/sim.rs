//! A scripted command transport for tests.
//!
//! Behaves like compliant firmware: hands out object numbers, remembers the
//! pages it was given, and logs every command it executes. Tests steer it
//! through the shared [`SimState`]: make a particular opcode fail, make it
//! refuse page reclaims for a while, or change the advertised capabilities.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlx_cmd::{
    Command, CommandError, CommandInterface, CommandOpcode, CommandOutput, CommandReturnStatus,
    EqState, HcaCaps, VportContext,
};

pub struct SimState {
    /// Every command executed, in order.
    pub log: Vec<Command>,
    next_number: u32,
    /// Opcodes to refuse; each refusal consumes one entry.
    pub fail_queue: VecDeque<CommandOpcode>,
    /// Pages the device asks for at each query.
    pub pages_wanted: i32,
    /// Device addresses currently held by the "hardware".
    pub lent_pages: Vec<u64>,
    /// Refuse this many reclaim attempts before cooperating.
    pub refuse_reclaims: u32,
    pub caps: HcaCaps,
    pub vport: VportContext,
}

impl SimState {
    /// Fails the next command with this opcode.
    pub fn fail_next(&mut self, opcode: CommandOpcode) {
        self.fail_queue.push_back(opcode);
    }

    pub fn opcodes(&self) -> Vec<CommandOpcode> {
        self.log.iter().map(Command::opcode).collect()
    }

    pub fn count(&self, opcode: CommandOpcode) -> usize {
        self.log.iter().filter(|c| c.opcode() == opcode).count()
    }
}

impl Default for SimState {
    fn default() -> SimState {
        SimState {
            log: Vec::new(),
            next_number: 1,
            fail_queue: VecDeque::new(),
            pages_wanted: 8,
            lent_pages: Vec::new(),
            refuse_reclaims: 0,
            caps: HcaCaps {
                num_ports: 1,
                log_pg_sz: 12,
                cqe_version: 1,
                max_tir: 1 << 12,
                max_rqt_size: 64,
                max_rx_ft_shift: 15,
                max_rx_flows: 1 << 20,
                max_fe_dest: 32,
            },
            vport: VportContext { mac_address: [0x02, 0, 0, 0xab, 0xcd, 0x01], mtu: 1500 },
        }
    }
}

pub struct SimTransport(Arc<Mutex<SimState>>);

impl SimTransport {
    pub fn new() -> (SimTransport, Arc<Mutex<SimState>>) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (SimTransport(state.clone()), state)
    }
}

impl CommandInterface for SimTransport {
    fn execute(
        &mut self,
        cmd: &Command,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut state = self.0.lock().expect("sim state poisoned");
        state.log.push(cmd.clone());

        if let Some(pos) = state.fail_queue.iter().position(|&op| op == cmd.opcode()) {
            state.fail_queue.remove(pos);
            return Err(CommandError::Returned(CommandReturnStatus::InternalError));
        }

        let out = match cmd {
            Command::QueryHcaCap => CommandOutput::Caps(state.caps.clone()),
            Command::QueryNicVportContext { .. } => CommandOutput::Vport(state.vport.clone()),
            Command::QueryPages(_) => CommandOutput::PageCount(state.pages_wanted),
            Command::GivePages(addrs) => {
                state.lent_pages.extend_from_slice(addrs);
                CommandOutput::Done
            }
            Command::ReclaimPages { count } => {
                if state.refuse_reclaims > 0 {
                    state.refuse_reclaims -= 1;
                    CommandOutput::Pages(Vec::new())
                } else {
                    let n = (*count as usize).min(state.lent_pages.len());
                    let at = state.lent_pages.len() - n;
                    CommandOutput::Pages(state.lent_pages.split_off(at))
                }
            }
            Command::QueryEq { .. } => CommandOutput::EqState(EqState {
                ok: true,
                consumer_counter: 0,
                producer_counter: 0,
            }),
            Command::AllocUar
            | Command::AllocPd
            | Command::AllocTransportDomain
            | Command::CreateEq(_)
            | Command::CreateCq { .. }
            | Command::CreateTis { .. }
            | Command::CreateSq { .. }
            | Command::CreateRq { .. }
            | Command::CreateTir { .. }
            | Command::CreateRqt { .. }
            | Command::CreateFlowTable { .. }
            | Command::CreateFlowGroup { .. } => {
                let n = state.next_number;
                state.next_number += 1;
                CommandOutput::Number(n)
            }
            _ => CommandOutput::Done,
        };
        Ok(out)
    }
}
