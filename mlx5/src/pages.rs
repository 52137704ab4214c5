//! Hardware page accounting.
//!
//! The hardware runs on pages of host memory it asks for in stages (boot,
//! init, steady-state). Pages handed over belong to the hardware until it
//! gives them back through a reclaim command; host memory backing an
//! unreclaimed page must never be freed, so a reclaim that keeps getting
//! refused ends with the pages deliberately surrendered (leaked) rather
//! than freed out from under the device.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use mlx_cmd::{Command, CommandGateway, CommandOutput, PageRequestType};
use nic_dma::{DmaAllocator, DmaRegion};

use crate::error::{Error, Result};

/// Most pages one ManagePages command carries.
const PAGES_PER_CMD: usize = 512;

/// The pages currently lent to the hardware, keyed by device address.
#[derive(Debug)]
pub struct PageBank {
    page_size: usize,
    pages: BTreeMap<u64, DmaRegion>,
}

impl PageBank {
    pub fn new(log_pg_sz: u8) -> PageBank {
        PageBank { page_size: 1 << log_pg_sz, pages: BTreeMap::new() }
    }

    pub fn lent(&self) -> usize {
        self.pages.len()
    }

    /// Asks the hardware how many pages it wants for this stage and hands
    /// them over. Returns how many were given.
    pub fn satisfy(
        &mut self,
        gw: &CommandGateway,
        dma: &dyn DmaAllocator,
        req: PageRequestType,
    ) -> Result<usize> {
        let wanted = match gw.execute(&Command::QueryPages(req))? {
            CommandOutput::PageCount(n) => n,
            _ => {
                return Err(Error::Command(mlx_cmd::CommandError::BadOutput(
                    mlx_cmd::CommandOpcode::QueryPages,
                )))
            }
        };
        if wanted <= 0 {
            return Ok(0);
        }
        self.give(gw, dma, wanted as usize)?;
        debug!("gave hardware {wanted} {req:?} ({} lent in total)", self.pages.len());
        Ok(wanted as usize)
    }

    fn give(&mut self, gw: &CommandGateway, dma: &dyn DmaAllocator, count: usize) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(PAGES_PER_CMD);
            let mut regions = Vec::with_capacity(batch);
            let mut addrs = Vec::with_capacity(batch);
            for _ in 0..batch {
                let region = dma.allocate(self.page_size, self.page_size)?;
                addrs.push(region.device_addr());
                regions.push(region);
            }
            gw.done(&Command::GivePages(addrs))?;
            // Only account pages the hardware actually accepted.
            for region in regions {
                self.pages.insert(region.device_addr(), region);
            }
            remaining -= batch;
        }
        Ok(())
    }

    /// Takes every lent page back, retrying refused reclaims with a delay.
    ///
    /// After `tries` rounds that make no progress the remaining pages are
    /// surrendered: their memory is leaked on purpose, because the hardware
    /// may still write to it.
    pub fn reclaim_all(
        &mut self,
        gw: &CommandGateway,
        tries: u32,
        delay: Duration,
    ) -> Result<()> {
        let mut refusals = 0;
        while !self.pages.is_empty() {
            let want = self.pages.len().min(PAGES_PER_CMD) as u32;
            let returned = match gw.execute(&Command::ReclaimPages { count: want }) {
                Ok(CommandOutput::Pages(addrs)) if !addrs.is_empty() => addrs,
                Ok(_) => {
                    refusals += 1;
                    Vec::new()
                }
                Err(e) => {
                    warn!("page reclaim refused: {e}");
                    refusals += 1;
                    Vec::new()
                }
            };
            for addr in returned {
                if self.pages.remove(&addr).is_none() {
                    panic!("hardware returned page {addr:#x} it was never lent");
                }
                refusals = 0;
            }
            if refusals > 0 {
                if refusals >= tries {
                    let n = self.pages.len();
                    error!("hardware kept {n} pages after {tries} reclaim attempts; leaking them");
                    for (_, region) in core::mem::take(&mut self.pages) {
                        core::mem::forget(region);
                    }
                    return Err(Error::PagesSurrendered(n));
                }
                thread::sleep(delay);
            }
        }
        Ok(())
    }
}
