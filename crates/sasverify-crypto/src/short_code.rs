//! Human comparable renderings of the SAS bytes.
//!
//! Both peers derive the same six bytes. They are shown either as three
//! four-digit numbers or as seven emoji picked from a fixed table of 64, so
//! users on both devices can compare them side by side.

/// Number of HKDF output bytes both encodings are taken from.
pub const SAS_BYTES: usize = 6;

/// Glyph and English name of every emoji, indexed by its 6-bit value.
pub const EMOJI_TABLE: [(&str, &str); 64] = [
    ("🐶", "Dog"),
    ("🐱", "Cat"),
    ("🦁", "Lion"),
    ("🐎", "Horse"),
    ("🦄", "Unicorn"),
    ("🐷", "Pig"),
    ("🐘", "Elephant"),
    ("🐰", "Rabbit"),
    ("🐼", "Panda"),
    ("🐓", "Rooster"),
    ("🐧", "Penguin"),
    ("🐢", "Turtle"),
    ("🐟", "Fish"),
    ("🐙", "Octopus"),
    ("🦋", "Butterfly"),
    ("🌷", "Flower"),
    ("🌳", "Tree"),
    ("🌵", "Cactus"),
    ("🍄", "Mushroom"),
    ("🌏", "Globe"),
    ("🌙", "Moon"),
    ("☁️", "Cloud"),
    ("🔥", "Fire"),
    ("🍌", "Banana"),
    ("🍎", "Apple"),
    ("🍓", "Strawberry"),
    ("🌽", "Corn"),
    ("🍕", "Pizza"),
    ("🎂", "Cake"),
    ("❤️", "Heart"),
    ("😀", "Smiley"),
    ("🤖", "Robot"),
    ("🎩", "Hat"),
    ("👓", "Glasses"),
    ("🔧", "Spanner"),
    ("🎅", "Santa"),
    ("👍", "Thumbs Up"),
    ("☂️", "Umbrella"),
    ("⌛", "Hourglass"),
    ("⏰", "Clock"),
    ("🎁", "Gift"),
    ("💡", "Light Bulb"),
    ("📕", "Book"),
    ("✏️", "Pencil"),
    ("📎", "Paperclip"),
    ("✂️", "Scissors"),
    ("🔒", "Lock"),
    ("🔑", "Key"),
    ("🔨", "Hammer"),
    ("☎️", "Telephone"),
    ("🏁", "Flag"),
    ("🚂", "Train"),
    ("🚲", "Bicycle"),
    ("✈️", "Aeroplane"),
    ("🚀", "Rocket"),
    ("🏆", "Trophy"),
    ("⚽", "Ball"),
    ("🎸", "Guitar"),
    ("🎺", "Trumpet"),
    ("🔔", "Bell"),
    ("⚓", "Anchor"),
    ("🎧", "Headphones"),
    ("📁", "Folder"),
    ("📌", "Pin"),
];

/// One emoji of the comparison sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SasEmoji {
    /// Position in [`EMOJI_TABLE`], always below 64.
    pub index: u8,
    pub glyph: &'static str,
    pub name: &'static str,
}

impl SasEmoji {
    fn from_index(index: u8) -> Self {
        let (glyph, name) = EMOJI_TABLE[usize::from(index & 0x3f)];
        Self {
            index: index & 0x3f,
            glyph,
            name,
        }
    }
}

/// The derived SAS bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCode {
    bytes: [u8; SAS_BYTES],
}

impl ShortCode {
    pub const fn from_bytes(bytes: [u8; SAS_BYTES]) -> Self {
        Self { bytes }
    }

    /// Three 13-bit numbers taken from the first 39 bits, each offset by 1000.
    pub fn decimals(&self) -> [u16; 3] {
        let b = self.bytes.map(u16::from);
        [
            ((b[0] << 5) | (b[1] >> 3)) + 1000,
            (((b[1] & 0x7) << 10) | (b[2] << 2) | (b[3] >> 6)) + 1000,
            (((b[3] & 0x3f) << 7) | (b[4] >> 1)) + 1000,
        ]
    }

    /// Seven 6-bit indices taken from the first 42 bits.
    // Each value is masked to 6 bits before the cast.
    #[allow(clippy::cast_possible_truncation)]
    pub fn emoji_indices(&self) -> [u8; 7] {
        let mut num = 0u64;
        for byte in self.bytes {
            num = (num << 8) | u64::from(byte);
        }
        let mut indices = [0u8; 7];
        for (i, index) in indices.iter_mut().enumerate() {
            let shift = 48 - 6 * (i + 1);
            *index = ((num >> shift) & 0x3f) as u8;
        }
        indices
    }

    pub fn emojis(&self) -> [SasEmoji; 7] {
        self.emoji_indices().map(SasEmoji::from_index)
    }
}

/// Render decimals as shown to the user, e.g. `"4567 1234 8901"`.
pub fn format_decimals(decimals: &[u16; 3]) -> String {
    decimals
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render emoji with their names, one per column.
pub fn format_emojis(emojis: &[SasEmoji]) -> String {
    emojis
        .iter()
        .map(|e| format!("{} {}", e.glyph, e.name))
        .collect::<Vec<_>>()
        .join(" | ")
}
