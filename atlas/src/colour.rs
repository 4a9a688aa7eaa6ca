use crate::common::*;

/// An RGB colour of a class in annotation and label rasters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b])
    }

    pub fn r(&self) -> u8 {
        self.0[0]
    }

    pub fn g(&self) -> u8 {
        self.0[1]
    }

    pub fn b(&self) -> u8 {
        self.0[2]
    }

    /// Blend with another colour, `ratio` being the weight of `self`.
    pub fn blend(&self, other: Rgb, ratio: f64) -> Rgb {
        let mix = |lhs: u8, rhs: u8| -> u8 {
            (ratio * lhs as f64 + (1.0 - ratio) * rhs as f64)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([
            mix(self.r(), other.r()),
            mix(self.g(), other.g()),
            mix(self.b(), other.b()),
        ])
    }
}

impl From<[u8; 3]> for Rgb {
    fn from(from: [u8; 3]) -> Self {
        Self(from)
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(from: Rgb) -> Self {
        from.0
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r(), self.g(), self.b())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_colours() {
        let white = Rgb::new(255, 255, 255);
        let black = Rgb::new(0, 0, 0);
        assert_eq!(white.blend(black, 0.75), Rgb::new(191, 191, 191));
        assert_eq!(white.blend(black, 1.0), white);
    }

    #[test]
    fn display_as_hex() {
        assert_eq!(Rgb::new(255, 0, 16).to_string(), "#ff0010");
    }
}
