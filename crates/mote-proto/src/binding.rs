//! LwM2M binding modes (`b=` registration parameter, resource /1/x/7).

use bitflags::bitflags;

bitflags! {
    /// Transports a client may be reached over.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Binding: u8 {
        /// UDP
        const U = 0b0000_0001;
        /// Queue mode: the client may sleep between updates.
        const Q = 0b0000_0010;
        /// SMS
        const S = 0b0000_0100;
        /// TCP
        const T = 0b0000_1000;
        /// Non-IP
        const N = 0b0001_0000;
    }
}

impl Binding {
    const LETTERS: [(Self, char); 5] =
        [(Self::U, 'U'), (Self::Q, 'Q'), (Self::S, 'S'), (Self::T, 'T'), (Self::N, 'N')];

    /// Render as the letters used in the `b=` query parameter.
    pub fn to_query(self) -> String {
        Self::LETTERS.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, c)| *c).collect()
    }

    /// Parse letters such as `UQ`. Unknown letters yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut binding = Self::empty();
        for c in text.trim().chars() {
            let (flag, _) = Self::LETTERS.iter().find(|(_, letter)| *letter == c)?;
            binding |= *flag;
        }
        Some(binding)
    }
}

impl Default for Binding {
    fn default() -> Self {
        Self::U
    }
}
