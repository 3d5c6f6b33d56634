#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn millis(&self) -> usize {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        }
    }

    /// Converts `amount` of this unit into `unit`, rounding down.
    pub fn convert(&self, amount: usize, unit: TimeUnit) -> usize {
        amount.saturating_mul(self.millis()) / unit.millis()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Time {
    pub amount: usize,
    pub unit: TimeUnit,
}

impl Time {
    pub fn new(amount: usize, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    pub fn convert(&self, unit: TimeUnit) -> Time {
        Time {
            amount: self.unit.convert(self.amount, unit),
            unit,
        }
    }
}

impl From<&Time> for chrono::Duration {
    fn from(time: &Time) -> Self {
        let millis = time.convert(TimeUnit::Milliseconds).amount;
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }
}

impl From<Time> for chrono::Duration {
    fn from(time: Time) -> Self {
        (&time).into()
    }
}

/// `amount` units of quota per `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frequency {
    pub amount: usize,
    pub interval: Time,
}

impl Frequency {
    pub fn new(amount: usize, interval: Time) -> Self {
        Self { amount, interval }
    }
}
