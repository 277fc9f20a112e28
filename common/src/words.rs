//! Dutch time-in-words layout: which words light up for a given hour and minute.
//!
//! Minutes are read to the nearest five with a qualifier: "precies" (exactly),
//! "ruim" (a little past) and "bijna" (almost). From minute 18 the clock talks
//! about the next hour ("tien voor half drie" at 14:20).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Het,
    Is,
    Am,
    Pm,
    Precies,
    Ruim,
    Bijna,
    Vijf,
    Tien,
    Kwart,
    Voor,
    Over,
    Half,
    /// Hour name, 0 for twelve and 1..=11 otherwise.
    Hour(u8),
}

use Segment::{Bijna, Half, Kwart, Over, Precies, Ruim, Tien, Vijf, Voor};

const HOUR_LEDS: [&[usize]; 12] = [
    &[5],
    &[16],
    &[15],
    &[14],
    &[6],
    &[7],
    &[8],
    &[9],
    &[10],
    &[11],
    &[12],
    &[13],
];

const HOUR_NAMES: [&str; 12] = [
    "TWAALF", "EEN", "TWEE", "DRIE", "VIER", "VIJF", "ZES", "ZEVEN", "ACHT", "NEGEN", "TIEN", "ELF",
];

impl Segment {
    pub fn leds(self) -> &'static [usize] {
        match self {
            Self::Het => &[2, 3, 4],
            Self::Is => &[51, 52, 53, 54, 55],
            Self::Am => &[1],
            Self::Pm => &[0],
            Self::Precies => &[36, 37, 38, 39, 40, 41, 42],
            Self::Ruim => &[47, 48, 49, 50],
            Self::Bijna => &[43, 44, 45, 46],
            Self::Vijf => &[35],
            Self::Tien => &[34],
            Self::Kwart => &[29, 30, 31, 32, 33],
            Self::Voor => &[21, 22, 23, 24],
            Self::Over => &[25, 26, 27, 28],
            Self::Half => &[17, 18, 19, 20],
            Self::Hour(index) => HOUR_LEDS[usize::from(index % 12)],
        }
    }

    /// Every word on the face, lead-in first and hours last.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..25).filter_map(Self::from_bit)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Het => "HET",
            Self::Is => "IS",
            Self::Am => "AM",
            Self::Pm => "PM",
            Self::Precies => "PRECIES",
            Self::Ruim => "RUIM",
            Self::Bijna => "BIJNA",
            Self::Vijf => "VIJF",
            Self::Tien => "TIEN",
            Self::Kwart => "KWART",
            Self::Voor => "VOOR",
            Self::Over => "OVER",
            Self::Half => "HALF",
            Self::Hour(index) => HOUR_NAMES[usize::from(index % 12)],
        }
    }

    /// The lead-in words that are lit regardless of the time.
    pub fn is_lead_in(self) -> bool {
        matches!(self, Self::Het | Self::Is)
    }

    fn bit(self) -> u32 {
        match self {
            Self::Het => 0,
            Self::Is => 1,
            Self::Am => 2,
            Self::Pm => 3,
            Self::Precies => 4,
            Self::Ruim => 5,
            Self::Bijna => 6,
            Self::Vijf => 7,
            Self::Tien => 8,
            Self::Kwart => 9,
            Self::Voor => 10,
            Self::Over => 11,
            Self::Half => 12,
            Self::Hour(index) => 13 + u32::from(index % 12),
        }
    }

    fn from_bit(bit: u32) -> Option<Self> {
        Some(match bit {
            0 => Self::Het,
            1 => Self::Is,
            2 => Self::Am,
            3 => Self::Pm,
            4 => Self::Precies,
            5 => Self::Ruim,
            6 => Self::Bijna,
            7 => Self::Vijf,
            8 => Self::Tien,
            9 => Self::Kwart,
            10 => Self::Voor,
            11 => Self::Over,
            12 => Self::Half,
            13..=24 => Self::Hour((bit - 13) as u8),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SegmentSet(u32);

impl SegmentSet {
    pub fn insert(&mut self, segment: Segment) {
        self.0 |= 1 << segment.bit();
    }

    pub fn contains(&self, segment: Segment) -> bool {
        self.0 & (1 << segment.bit()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..32)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .filter_map(Segment::from_bit)
    }
}

impl FromIterator<Segment> for SegmentSet {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        let mut set = Self::default();
        for segment in iter {
            set.insert(segment);
        }
        set
    }
}

/// Minute words keyed by minute. 18 and 19 both read "bijna tien voor half".
const MINUTE_WORDS: [&[Segment]; 60] = [
    /* 00 */ &[Precies],
    /* 01 */ &[Ruim, Over],
    /* 02 */ &[Ruim, Over],
    /* 03 */ &[Bijna, Vijf, Over],
    /* 04 */ &[Bijna, Vijf, Over],
    /* 05 */ &[Precies, Vijf, Over],
    /* 06 */ &[Ruim, Vijf, Over],
    /* 07 */ &[Ruim, Vijf, Over],
    /* 08 */ &[Bijna, Tien, Over],
    /* 09 */ &[Bijna, Tien, Over],
    /* 10 */ &[Precies, Tien, Over],
    /* 11 */ &[Ruim, Tien, Over],
    /* 12 */ &[Ruim, Tien, Over],
    /* 13 */ &[Bijna, Kwart, Over],
    /* 14 */ &[Bijna, Kwart, Over],
    /* 15 */ &[Precies, Kwart, Over],
    /* 16 */ &[Ruim, Kwart, Over],
    /* 17 */ &[Ruim, Kwart, Over],
    /* 18 */ &[Bijna, Tien, Voor, Half],
    /* 19 */ &[Bijna, Tien, Voor, Half],
    /* 20 */ &[Precies, Tien, Voor, Half],
    /* 21 */ &[Ruim, Tien, Voor, Half],
    /* 22 */ &[Ruim, Tien, Voor, Half],
    /* 23 */ &[Bijna, Vijf, Voor, Half],
    /* 24 */ &[Bijna, Vijf, Voor, Half],
    /* 25 */ &[Precies, Vijf, Voor, Half],
    /* 26 */ &[Ruim, Vijf, Voor, Half],
    /* 27 */ &[Ruim, Vijf, Voor, Half],
    /* 28 */ &[Bijna, Half],
    /* 29 */ &[Bijna, Half],
    /* 30 */ &[Precies, Half],
    /* 31 */ &[Ruim, Half],
    /* 32 */ &[Ruim, Half],
    /* 33 */ &[Bijna, Vijf, Over, Half],
    /* 34 */ &[Bijna, Vijf, Over, Half],
    /* 35 */ &[Precies, Vijf, Over, Half],
    /* 36 */ &[Ruim, Vijf, Over, Half],
    /* 37 */ &[Ruim, Vijf, Over, Half],
    /* 38 */ &[Bijna, Tien, Over, Half],
    /* 39 */ &[Bijna, Tien, Over, Half],
    /* 40 */ &[Precies, Tien, Over, Half],
    /* 41 */ &[Ruim, Tien, Over, Half],
    /* 42 */ &[Ruim, Tien, Over, Half],
    /* 43 */ &[Bijna, Kwart, Voor],
    /* 44 */ &[Bijna, Kwart, Voor],
    /* 45 */ &[Precies, Kwart, Voor],
    /* 46 */ &[Ruim, Kwart, Voor],
    /* 47 */ &[Ruim, Kwart, Voor],
    /* 48 */ &[Bijna, Tien, Voor],
    /* 49 */ &[Bijna, Tien, Voor],
    /* 50 */ &[Precies, Tien, Voor],
    /* 51 */ &[Ruim, Tien, Voor],
    /* 52 */ &[Ruim, Tien, Voor],
    /* 53 */ &[Bijna, Vijf, Voor],
    /* 54 */ &[Bijna, Vijf, Voor],
    /* 55 */ &[Precies, Vijf, Voor],
    /* 56 */ &[Ruim, Vijf, Voor],
    /* 57 */ &[Ruim, Vijf, Voor],
    /* 58 */ &[Bijna],
    /* 59 */ &[Bijna],
];

/// Minute after which the clock names the coming hour.
const NEXT_HOUR_AFTER: u32 = 17;

/// 24-hour value of the hour being named, after the next-hour rollover.
pub fn effective_hour(hour: u32, minute: u32) -> u32 {
    let hour = hour % 24;
    if minute % 60 > NEXT_HOUR_AFTER {
        (hour + 1) % 24
    } else {
        hour
    }
}

/// The named hour on a 1..=12 dial.
pub fn display_hour(hour: u32, minute: u32) -> u32 {
    match effective_hour(hour, minute) % 12 {
        0 => 12,
        h => h,
    }
}

/// AM/PM follows the named hour, so 11:45 reads "kwart voor twaalf" PM.
pub fn render(hour: u32, minute: u32) -> SegmentSet {
    let minute = minute % 60;
    let mut set = SegmentSet::default();
    set.insert(Segment::Het);
    set.insert(Segment::Is);
    set.insert(if effective_hour(hour, minute) < 12 {
        Segment::Am
    } else {
        Segment::Pm
    });
    set.insert(Segment::Hour((display_hour(hour, minute) % 12) as u8));
    for segment in MINUTE_WORDS[minute as usize] {
        set.insert(*segment);
    }
    set
}
