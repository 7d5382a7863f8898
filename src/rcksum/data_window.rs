// A cursor over one scan buffer. The window under consideration is
// [pos, pos + context); the scan stops once the window's tail reaches the end
// of the valid data.
pub struct DataWindow<'a> {
    data: &'a [u8],
    pos: usize,
    blocksize: usize,
    context: usize,
}

impl<'a> DataWindow<'a> {
    pub fn new(data: &'a [u8], blocksize: usize, context: usize) -> Self {
        DataWindow {
            data,
            pos: 0,
            blocksize,
            context,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn at_limit(&self) -> bool {
        self.pos + self.context >= self.data.len()
    }

    // How far the window tail would stick out past the valid data.
    pub fn overrun(&self) -> usize {
        (self.pos + self.context).saturating_sub(self.data.len())
    }

    pub fn advance_bytes(&mut self, n: usize) {
        self.pos += n;
    }

    // The nth whole block starting at the current position.
    pub fn block(&self, n: usize) -> &'a [u8] {
        let start = self.pos + n * self.blocksize;
        &self.data[start..start + self.blocksize]
    }

    // The full match window: context bytes from the current position.
    pub fn window(&self) -> &'a [u8] {
        &self.data[self.pos..self.pos + self.context]
    }

    // The byte leaving (n = 0) or entering (n = 1, 2, ...) the nth block's
    // window on a one-byte slide.
    pub fn byte_at_block(&self, n: usize) -> u8 {
        self.data[self.pos + n * self.blocksize]
    }
}
