//! Built-in bootstrap images, hand-assembled.
//!
//! Each program is stored as its word listing and flattened to a
//! little-endian byte image at the load site.

use crate::constants::Word;

/// Echo console input back out, forever.
///
/// ```text
/// loop:  tstb @#177560     ; receiver done?
///        bpl  loop
///        movb @#177562, r0 ; take the byte
/// wait:  tstb @#177564     ; transmitter ready?
///        bpl  wait
///        movb r0, @#177566 ; send it back
///        br   loop
/// ```
const ECHO: &[Word] = &[
    0o105_737, 0o177_560, // tstb @#RCSR
    0o100_375, //           bpl .-4
    0o113_700, 0o177_562, // movb @#RBUF, r0
    0o105_737, 0o177_564, // tstb @#XCSR
    0o100_375, //           bpl .-4
    0o110_037, 0o177_566, // movb r0, @#XBUF
    0o000_765, //           br .-18
];

/// Count to ten in r0, then halt.
///
/// ```text
///        clr  r0
/// loop:  inc  r0
///        cmp  r0, #10
///        bne  loop
///        halt
/// ```
const COUNT: &[Word] = &[
    0o005_000, //           clr r0
    0o005_200, //           inc r0
    0o020_027, 0o000_012, // cmp r0, #10
    0o001_374, //           bne .-6
    0o000_000, //           halt
];

fn image(words: &[Word]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[must_use]
pub fn echo() -> Vec<u8> {
    image(ECHO)
}

#[must_use]
pub fn count() -> Vec<u8> {
    image(COUNT)
}
