use bitflags::bitflags;

bitflags! {
    /// Flags byte at the start of every data fragment
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct FragmentFlags: u8 {
        /// the fragment carries the flow header (signature and optional back-reference)
        const HEADER      = 0b1000_0000;
        /// the fragment continues a message started in an earlier fragment
        const BEFORE_PART = 0b0010_0000;
        /// the message continues in the following fragment
        const AFTER_PART  = 0b0001_0000;
        /// the sender gave up on the flow's data
        const ABANDONMENT = 0b0000_0010;
        /// last fragment of the flow
        const END         = 0b0000_0001;
    }
}

impl FragmentFlags {
    pub fn is_complete_message(&self) -> bool {
        !self.intersects(FragmentFlags::BEFORE_PART | FragmentFlags::AFTER_PART)
    }
}
