// Copyright 2025 FerroDB Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::{Condvar, Mutex};

use crate::types::Deadline;

/// Counting semaphore admitting a bounded number of concurrent global
/// acquisitions. Fairness among ticket waiters is not guaranteed.
pub struct TicketHolder {
    capacity: u32,
    available: Mutex<u32>,
    released: Condvar,
}

impl TicketHolder {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    /// Take a ticket without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    /// Block until a ticket is available or `deadline` expires. Returns
    /// whether a ticket was obtained.
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        let mut available = self.available.lock();
        loop {
            if *available > 0 {
                *available -= 1;
                return true;
            }
            match deadline.instant() {
                None => self.released.wait(&mut available),
                Some(instant) => {
                    if self.released.wait_until(&mut available, instant).timed_out() {
                        if *available > 0 {
                            *available -= 1;
                            return true;
                        }
                        return false;
                    }
                }
            }
        }
    }

    /// Return a ticket. Releasing more tickets than were acquired is a
    /// contract violation.
    pub fn release(&self) {
        let mut available = self.available.lock();
        assert!(*available < self.capacity, "ticket released without a matching acquire");
        *available += 1;
        drop(available);
        self.released.notify_one();
    }

    /// Number of tickets currently handed out.
    pub fn used(&self) -> u32 {
        self.capacity - *self.available.lock()
    }

    pub fn available(&self) -> u32 {
        *self.available.lock()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for TicketHolder {
    fn drop(&mut self) {
        // Callers must unwire the holder from every locker first.
        assert_eq!(self.used(), 0, "TicketHolder dropped with outstanding tickets");
    }
}

impl std::fmt::Debug for TicketHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketHolder")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
