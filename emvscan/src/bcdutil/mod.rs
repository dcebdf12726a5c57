use thiserror::Error;

const ASCII_CHARACTER_0: u8 = 0x30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BcdError {
    #[error("invalid BCD nibble {nibble:X} at byte {index}")]
    InvalidNibble { index: usize, nibble: u8 },

    #[error("{digits} digits do not fit into {size} bytes")]
    TooLong { digits: usize, size: usize },

    #[error("not an ASCII digit: {0:02X}")]
    NotADigit(u8),
}

fn digit(ascii: u8) -> Result<u8, BcdError> {
    match ascii.checked_sub(ASCII_CHARACTER_0) {
        Some(d) if d <= 9 => Ok(d),
        _ => Err(BcdError::NotADigit(ascii)),
    }
}

/// Decodes packed BCD into ASCII digits.
///
/// Compressed numeric (cn) values end with `F` padding nibbles; padding is
/// accepted only at the tail.
pub fn bcd_to_ascii(bcd_data: &[u8]) -> Result<String, BcdError> {
    let mut ascii_output = String::with_capacity(bcd_data.len() * 2);
    let mut padding = false;

    for (index, byte) in bcd_data.iter().enumerate() {
        for nibble in [byte >> 4, byte & 0xF] {
            match nibble {
                0xF => padding = true,
                0..=9 if !padding => ascii_output.push((ASCII_CHARACTER_0 + nibble) as char),
                _ => return Err(BcdError::InvalidNibble { index, nibble }),
            }
        }
    }

    Ok(ascii_output)
}

//cn = 12 34 56 78 90 12 3F FF
pub fn ascii_to_bcd_cn(ascii_data: &[u8], size: usize) -> Result<Vec<u8>, BcdError> {
    if ascii_data.len() > size * 2 {
        return Err(BcdError::TooLong {
            digits: ascii_data.len(),
            size,
        });
    }

    let mut bcd_output: Vec<u8> = Vec::with_capacity(size);
    for pair in ascii_data.chunks(2) {
        let high = digit(pair[0])?;
        let low = match pair.get(1) {
            Some(c) => digit(*c)?,
            None => 0xF,
        };
        bcd_output.push(high << 4 | low);
    }
    bcd_output.resize(size, 0xFF);

    Ok(bcd_output)
}

//n = 00 00 00 01 23 45
pub fn ascii_to_bcd_n(ascii_data: &[u8], size: usize) -> Result<Vec<u8>, BcdError> {
    if ascii_data.len() > size * 2 {
        return Err(BcdError::TooLong {
            digits: ascii_data.len(),
            size,
        });
    }

    let mut digits: Vec<u8> = vec![0; size * 2 - ascii_data.len()];
    for c in ascii_data {
        digits.push(digit(*c)?);
    }

    Ok(digits.chunks(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}
