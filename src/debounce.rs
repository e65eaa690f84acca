use bitflags::Flags;

const MAX_BITS: usize = u16::BITS as usize;

/// Per bit hysteresis over a flag set sampled once per cycle.
///
/// A bit latches after being seen set for `set_hold` consecutive samples and
/// releases after being seen clear for `clear_hold` consecutive samples. A
/// single noisy sample in either direction restarts the count, so a bit
/// that toggles every cycle never changes its latched value.
pub struct Debouncer<F: Flags<Bits = u16> + Copy> {
    set_hold: u8,
    clear_hold: u8,
    set_counts: [u8; MAX_BITS],
    clear_counts: [u8; MAX_BITS],
    latched: F,
}

impl<F: Flags<Bits = u16> + Copy> Debouncer<F> {
    pub fn new(set_hold: u8, clear_hold: u8) -> Self {
        Self {
            set_hold: set_hold.max(1),
            clear_hold: clear_hold.max(1),
            set_counts: [0; MAX_BITS],
            clear_counts: [0; MAX_BITS],
            latched: F::empty(),
        }
    }

    /// Same hold time in both directions.
    pub fn symmetric(hold: u8) -> Self {
        Self::new(hold, hold)
    }

    /// Feed this cycle's raw flags, returns the latched set.
    pub fn update(&mut self, active: F) -> F {
        let active = active.bits();
        let mut latched = self.latched.bits();

        for bit in 0..MAX_BITS {
            let mask = 1u16 << bit;

            if active & mask != 0 {
                self.clear_counts[bit] = 0;
                self.set_counts[bit] = self.set_counts[bit].saturating_add(1);
                if self.set_counts[bit] >= self.set_hold {
                    latched |= mask;
                }
            } else {
                self.set_counts[bit] = 0;
                if latched & mask != 0 {
                    self.clear_counts[bit] = self.clear_counts[bit].saturating_add(1);
                    if self.clear_counts[bit] >= self.clear_hold {
                        latched &= !mask;
                        self.clear_counts[bit] = 0;
                    }
                }
            }
        }

        self.latched = F::from_bits_retain(latched);
        self.latched
    }

    pub fn latched(&self) -> F {
        self.latched
    }

    /// Bits still counting toward a change of their latched value.
    pub fn pending(&self) -> F {
        let mut pending = 0u16;
        for bit in 0..MAX_BITS {
            let mask = 1u16 << bit;
            let latched = self.latched.bits() & mask != 0;
            if (!latched && self.set_counts[bit] > 0) || (latched && self.clear_counts[bit] > 0) {
                pending |= mask;
            }
        }

        F::from_bits_retain(pending)
    }

    /// Drop every latched bit and count, used when the fault source goes away
    /// entirely (e.g. adapter removed).
    pub fn reset(&mut self) {
        self.set_counts = [0; MAX_BITS];
        self.clear_counts = [0; MAX_BITS];
        self.latched = F::empty();
    }
}
