use std::collections::BTreeMap;

/// Bit-level progress of a channel while it occupies a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Progress {
    /// Count of bit levels folded in so far.
    Dense(u32),
    /// Bitmask of the bit levels folded in so far.
    Sparse(u32),
}

#[derive(Clone, Debug)]
struct RegisterState {
    channel: usize,
    sum: i64,
    progress: Progress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStatistics {
    pub replace_count: u64,
    pub memory_access_count: u64,
    pub registers_in_use: usize,
    pub spill_entries: usize,
}

/// A register file narrower than the number of logical accumulation channels.
///
/// Channels are summed across `S` bit levels, processed MSB to LSB. When every
/// register is occupied, the victim is (in priority order) any channel that is
/// provably complete, else the channel closest to completion. Evicted sums
/// move to a spill store; reloading or spilling a sum counts one memory
/// access, and each forced replacement is counted as well. A channel lives in
/// at most one of {register, spill store} at any time.
pub struct AccumulatorCache {
    s_bits: u32,
    sparse_enable: bool,
    registers: Vec<Option<RegisterState>>,
    spill: BTreeMap<usize, i64>,
    replace_count: u64,
    memory_access_count: u64,
}

impl AccumulatorCache {
    pub fn new(num_registers: usize, s_bits: u32, sparse_enable: bool) -> Self {
        assert!(num_registers > 0, "register file cannot be empty");
        assert!(
            (1..=32).contains(&s_bits),
            "unsupported bit width {s_bits}"
        );
        Self {
            s_bits,
            sparse_enable,
            registers: vec![None; num_registers],
            spill: BTreeMap::new(),
            replace_count: 0,
            memory_access_count: 0,
        }
    }

    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    /// Whether `channel` currently occupies a register.
    pub fn is_resident(&self, channel: usize) -> bool {
        self.register_of(channel).is_some()
    }

    fn register_of(&self, channel: usize) -> Option<usize> {
        self.registers
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.channel == channel))
    }

    fn free_register(&self) -> Option<usize> {
        self.registers.iter().position(|r| r.is_none())
    }

    fn fresh_progress(&self) -> Progress {
        if self.sparse_enable {
            Progress::Sparse(0)
        } else {
            Progress::Dense(0)
        }
    }

    /// All `s_bits` levels have been folded in.
    fn is_fully_processed(&self, progress: Progress) -> bool {
        match progress {
            Progress::Dense(count) => count >= self.s_bits,
            Progress::Sparse(mask) => mask.count_ones() == self.s_bits,
        }
    }

    /// The channel can receive no further contributions. In sparse mode a
    /// channel is also done the moment the LSB has been folded in: levels are
    /// processed MSB to LSB, so nothing lower will ever arrive.
    fn is_complete(&self, progress: Progress, current_bit_level: u32) -> bool {
        if self.is_fully_processed(progress) {
            return true;
        }
        match progress {
            Progress::Sparse(mask) => current_bit_level == 0 && mask & 1 != 0,
            Progress::Dense(_) => false,
        }
    }

    /// Closeness-to-completion score; the smallest score is evicted first.
    /// Dense: bit levels processed so far. Sparse: the lowest bit level
    /// missing from the processed set, except that an untouched register
    /// scores `s_bits`.
    fn score(&self, progress: Progress) -> u32 {
        match progress {
            Progress::Dense(count) => count,
            Progress::Sparse(0) => self.s_bits,
            Progress::Sparse(mask) => mask.trailing_ones().min(self.s_bits),
        }
    }

    fn find_victim(&self, current_bit_level: u32) -> usize {
        let mut best_idx = 0;
        let mut best_score = u32::MAX;
        for (idx, register) in self.registers.iter().enumerate() {
            let Some(register) = register else {
                continue;
            };
            if self.is_complete(register.progress, current_bit_level) {
                return idx;
            }
            let score = self.score(register.progress);
            if score < best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        best_idx
    }

    /// Write the register's sum to the spill store and clear the register.
    fn evict(&mut self, reg_idx: usize) {
        let Some(register) = self.registers[reg_idx].take() else {
            return;
        };
        self.spill.insert(register.channel, register.sum);
        self.memory_access_count += 1;
    }

    /// Find or allocate a register for `channel`.
    ///
    /// A hit costs nothing. A spill-store hit reloads the sum (one memory
    /// access); otherwise the channel starts at zero. When the file is full a
    /// victim is evicted, costing one memory access plus one replacement.
    /// Returns the register index and the channel's running sum.
    pub fn get_or_allocate(&mut self, channel: usize, current_bit_level: u32) -> (usize, i64) {
        if let Some(idx) = self.register_of(channel) {
            let sum = self.registers[idx].as_ref().map(|r| r.sum).unwrap_or(0);
            return (idx, sum);
        }

        let sum = match self.spill.remove(&channel) {
            Some(sum) => {
                self.memory_access_count += 1;
                sum
            }
            None => 0,
        };

        let idx = match self.free_register() {
            Some(idx) => idx,
            None => {
                // A fully-processed channel is evicted without scoring the
                // rest of the file.
                let victim = self
                    .registers
                    .iter()
                    .position(|r| {
                        r.as_ref()
                            .is_some_and(|r| self.is_fully_processed(r.progress))
                    })
                    .unwrap_or_else(|| self.find_victim(current_bit_level));
                self.evict(victim);
                self.replace_count += 1;
                victim
            }
        };

        self.registers[idx] = Some(RegisterState {
            channel,
            sum,
            progress: self.fresh_progress(),
        });
        (idx, sum)
    }

    /// Fold a partial product into a register's running sum.
    pub fn add(&mut self, reg_idx: usize, delta: i64) {
        if let Some(register) = self.registers[reg_idx].as_mut() {
            register.sum += delta;
        }
    }

    /// Record that `bit_level` has been folded into the register.
    pub fn update_progress(&mut self, reg_idx: usize, bit_level: u32) {
        let Some(register) = self.registers[reg_idx].as_mut() else {
            return;
        };
        register.progress = match register.progress {
            Progress::Dense(count) => Progress::Dense(count + 1),
            Progress::Sparse(mask) => Progress::Sparse(mask | 1 << bit_level),
        };
    }

    /// Spill every provably-complete register, freeing its slot. Costs one
    /// memory access per spilled register but no replacement.
    pub fn retire_completed(&mut self, current_bit_level: u32) {
        for idx in 0..self.registers.len() {
            let complete = self.registers[idx]
                .as_ref()
                .is_some_and(|r| self.is_complete(r.progress, current_bit_level));
            if complete {
                self.evict(idx);
            }
        }
    }

    /// Spill every occupied register (one memory access each) and drain the
    /// spill store, yielding the final sum of every channel ever referenced.
    /// An immediate second call returns an empty map.
    pub fn flush_all(&mut self) -> BTreeMap<usize, i64> {
        for idx in 0..self.registers.len() {
            self.evict(idx);
        }
        std::mem::take(&mut self.spill)
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            replace_count: self.replace_count,
            memory_access_count: self.memory_access_count,
            registers_in_use: self.registers.iter().filter(|r| r.is_some()).count(),
            spill_entries: self.spill.len(),
        }
    }
}
