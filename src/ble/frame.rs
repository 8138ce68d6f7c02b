use super::BleError;

/// Largest message an initial fragment can announce.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

const INIT_HEADER_LEN: usize = 3;

/// `seq(1) ‖ payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub seq: u8,
    pub data: Vec<u8>,
}

impl ContinuationFrame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BleError> {
        match bytes {
            [seq, data @ ..] if !data.is_empty() => Ok(Self { seq: *seq, data: data.to_vec() }),
            _ => Err(BleError::InvalidLength),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.seq);
        out.extend_from_slice(&self.data);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BleCommand {
    Ping = 0x81,
    Keepalive = 0x82,
    Msg = 0x83,
    Cancel = 0xBE,
    Error = 0xBF,
}

impl TryFrom<u8> for BleCommand {
    type Error = BleError;

    fn try_from(value: u8) -> Result<Self, BleError> {
        match value {
            0x81 => Ok(Self::Ping),
            0x82 => Ok(Self::Keepalive),
            0x83 => Ok(Self::Msg),
            0xBE => Ok(Self::Cancel),
            0xBF => Ok(Self::Error),
            other => Err(BleError::InvalidCommand(other)),
        }
    }
}

/// A complete BLE message before fragmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleFrame {
    pub cmd: BleCommand,
    pub data: Vec<u8>,
}

impl BleFrame {
    pub fn new(cmd: BleCommand, data: Vec<u8>) -> Self {
        Self { cmd, data }
    }

    pub fn error(code: u8) -> Self {
        Self::new(BleCommand::Error, vec![code])
    }

    /// Split into fragments of at most `max_len` bytes: an initial
    /// fragment `cmd ‖ len(2, BE) ‖ data` followed by continuation frames
    /// with sequence numbers from 0, wrapping after 0x7F.
    pub fn fragments(&self, max_len: usize) -> Result<Vec<Vec<u8>>, BleError> {
        if max_len < INIT_HEADER_LEN + 1 {
            return Err(BleError::FragmentTooSmall(max_len));
        }
        if self.data.len() > MAX_MESSAGE_LEN {
            return Err(BleError::InvalidLength);
        }

        let (head, mut rest) = self.data.split_at(self.data.len().min(max_len - INIT_HEADER_LEN));
        let mut initial = Vec::with_capacity(INIT_HEADER_LEN + head.len());
        initial.push(self.cmd as u8);
        initial.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        initial.extend_from_slice(head);
        let mut fragments = vec![initial];

        let mut seq: u8 = 0;
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(max_len - 1));
            fragments.push(ContinuationFrame { seq, data: chunk.to_vec() }.to_bytes());
            seq = (seq + 1) & 0x7F;
            rest = tail;
        }
        Ok(fragments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleFrameParserResult {
    Done,
    MoreFragmentsExpected,
}

struct Partial {
    cmd: BleCommand,
    len: usize,
    data: Vec<u8>,
    next_seq: u8,
}

/// Reassembles fragments into a `BleFrame`.
#[derive(Default)]
pub struct BleFrameParser {
    partial: Option<Partial>,
}

impl BleFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, fragment: &[u8]) -> Result<BleFrameParserResult, BleError> {
        let Some(partial) = self.partial.as_mut() else {
            return self.start(fragment);
        };
        if partial.data.len() >= partial.len {
            // A finished frame is waiting to be taken; a new fragment starts over.
            return self.start(fragment);
        }

        let frame = ContinuationFrame::from_bytes(fragment)?;
        if frame.seq != partial.next_seq {
            return Err(BleError::InvalidSeq { expected: partial.next_seq, got: frame.seq });
        }
        partial.next_seq = (partial.next_seq + 1) & 0x7F;
        partial.data.extend_from_slice(&frame.data);
        if partial.data.len() > partial.len {
            return Err(BleError::InvalidLength);
        }
        Ok(self.status())
    }

    fn start(&mut self, fragment: &[u8]) -> Result<BleFrameParserResult, BleError> {
        let [cmd, hi, lo, data @ ..] = fragment else {
            if fragment.first().is_some_and(|b| b & 0x80 == 0) {
                return Err(BleError::UnexpectedContinuation);
            }
            return Err(BleError::InvalidLength);
        };
        if cmd & 0x80 == 0 {
            return Err(BleError::UnexpectedContinuation);
        }
        let cmd = BleCommand::try_from(*cmd)?;
        let len = u16::from_be_bytes([*hi, *lo]) as usize;
        if data.len() > len {
            return Err(BleError::InvalidLength);
        }
        self.partial = Some(Partial { cmd, len, data: data.to_vec(), next_seq: 0 });
        Ok(self.status())
    }

    fn status(&self) -> BleFrameParserResult {
        match &self.partial {
            Some(p) if p.data.len() >= p.len => BleFrameParserResult::Done,
            _ => BleFrameParserResult::MoreFragmentsExpected,
        }
    }

    /// The reassembled frame, once `update` has returned `Done`.
    pub fn frame(&self) -> Option<BleFrame> {
        match &self.partial {
            Some(p) if p.data.len() >= p.len => Some(BleFrame::new(p.cmd, p.data.clone())),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_decode() {
        let frame = ContinuationFrame::from_bytes(&[0x00, 0x01, 0x02]).unwrap();
        assert_eq!(frame.seq, 0);
        assert_eq!(frame.data, vec![0x01, 0x02]);
        assert_eq!(frame.to_bytes(), vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_continuation_too_short() {
        assert_eq!(ContinuationFrame::from_bytes(&[0x05]), Err(BleError::InvalidLength));
        assert_eq!(ContinuationFrame::from_bytes(&[]), Err(BleError::InvalidLength));
    }

    #[test]
    fn test_fragments_layout() {
        let data: Vec<u8> = (0..40).collect();
        let fragments = BleFrame::new(BleCommand::Msg, data.clone()).fragments(20).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(&fragments[0][..3], &[0x83, 0x00, 40], "initial fragment header");
        assert_eq!(fragments[0].len(), 20);
        assert_eq!(fragments[1][0], 0, "first continuation has seq 0");
        assert_eq!(fragments[2][0], 1);
        assert_eq!(fragments[2].len(), 1 + 40 - 17 - 19);
        assert!(fragments.iter().all(|f| f.len() <= 20));
    }

    #[test]
    fn test_fragments_empty_payload() {
        let fragments = BleFrame::new(BleCommand::Keepalive, vec![]).fragments(20).unwrap();
        assert_eq!(fragments, vec![vec![0x82, 0x00, 0x00]]);
    }

    #[test]
    fn test_fragment_length_too_small() {
        let frame = BleFrame::new(BleCommand::Msg, vec![1]);
        assert_eq!(frame.fragments(3), Err(BleError::FragmentTooSmall(3)));
    }

    #[test]
    fn test_parser_reassembles() {
        let data: Vec<u8> = (0..100).collect();
        let frame = BleFrame::new(BleCommand::Msg, data);
        let mut parser = BleFrameParser::new();
        let fragments = frame.fragments(20).unwrap();
        let (last, init) = fragments.split_last().unwrap();
        for fragment in init {
            assert_eq!(parser.update(fragment).unwrap(), BleFrameParserResult::MoreFragmentsExpected);
            assert!(parser.frame().is_none());
        }
        assert_eq!(parser.update(last).unwrap(), BleFrameParserResult::Done);
        assert_eq!(parser.frame(), Some(frame));
    }

    #[test]
    fn test_parser_rejects_bad_sequence() {
        let mut parser = BleFrameParser::new();
        parser.update(&[0x83, 0x00, 0x04, 0xAA]).unwrap();
        assert_eq!(
            parser.update(&[0x01, 0xBB]),
            Err(BleError::InvalidSeq { expected: 0, got: 1 })
        );
    }

    #[test]
    fn test_parser_rejects_orphan_continuation() {
        let mut parser = BleFrameParser::new();
        assert_eq!(parser.update(&[0x00, 0x01]), Err(BleError::UnexpectedContinuation));
        assert_eq!(parser.update(&[0x99, 0x00, 0x00]), Err(BleError::InvalidCommand(0x99)));
    }

    #[test]
    fn test_parser_reset_between_frames() {
        let mut parser = BleFrameParser::new();
        assert_eq!(parser.update(&[0x81, 0x00, 0x01, 0x42]).unwrap(), BleFrameParserResult::Done);
        parser.reset();
        assert!(parser.frame().is_none());
        assert_eq!(parser.update(&[0xBE, 0x00, 0x00]).unwrap(), BleFrameParserResult::Done);
        assert_eq!(parser.frame().unwrap().cmd, BleCommand::Cancel);
    }
}
