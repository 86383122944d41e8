// Binary codec used by every packet on the wire.
// All integers travel big-endian, floats as their IEEE-754 bit pattern.

mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn write(&self, writer: &mut Writer);

    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.size());
        self.write(&mut writer);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        // trailing garbage is a malformed packet, not padding
        if reader.size() != 0 {
            return Err(ReaderError::InvalidSize);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        uid: u64,
        counter: i32,
        location: f64,
    }

    impl Serializer for Sample {
        fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
            Ok(Self {
                uid: reader.read_u64()?,
                counter: reader.read_i32()?,
                location: reader.read_f64()?,
            })
        }

        fn write(&self, writer: &mut Writer) {
            writer.write_u64(&self.uid);
            writer.write_i32(&self.counter);
            writer.write_f64(&self.location);
        }

        fn size(&self) -> usize {
            8 + 4 + 8
        }
    }

    #[test]
    fn test_round_trip() {
        let sample = Sample {
            uid: 0xDEAD_BEEF_CAFE_F00D,
            counter: -42,
            location: 0.732,
        };
        let bytes = sample.to_bytes();
        assert_eq!(bytes.len(), sample.size());
        assert_eq!(Sample::from_bytes(&bytes).unwrap(), sample);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let sample = Sample {
            uid: 1,
            counter: 0,
            location: 0.0,
        };
        let mut bytes = sample.to_bytes();
        bytes.push(0);
        assert!(matches!(
            Sample::from_bytes(&bytes),
            Err(ReaderError::InvalidSize)
        ));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let sample = Sample {
            uid: 1,
            counter: 0,
            location: 0.0,
        };
        let bytes = sample.to_bytes();
        assert!(Sample::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
