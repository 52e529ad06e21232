use core::fmt::{Display, Formatter, Result, Write};

use heapless::String;
use strum::{EnumIter, IntoStaticStr};

use crate::config::LUX_TEXT_CAPACITY;

// every u16 must fit, "65535" is five characters
const _: () = assert!(LUX_TEXT_CAPACITY >= 5);

/// A light sensor measurement, kept both as a number and as the text that
/// goes on the display and to the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LuxReading {
    lux: u16,
    text: String<LUX_TEXT_CAPACITY>,
}

impl LuxReading {
    pub fn new(lux: u16) -> Self {
        let mut text = String::new();
        let written = write!(text, "{}", lux);
        debug_assert!(written.is_ok(), "lux text capacity too small");
        Self { lux, text }
    }

    pub fn lux(&self) -> u16 {
        self.lux
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Display for LuxReading {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{} lx", self.text)
    }
}

/// Periodic work of the main loop, in the order it runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum Task {
    #[strum(serialize = "sensor read")]
    SampleSensor, // read the light sensor
    #[strum(serialize = "mqtt publish")]
    Publish, // send the last reading to the broker
    #[strum(serialize = "display refresh")]
    RefreshDisplay, // redraw the OLED if the value changed
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str((*self).into())
    }
}
