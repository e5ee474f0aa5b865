/// Associates a registered resource with a slot in the loop's arenas.
///
/// `Token` is a wrapper around `usize` and is the key under which handles
/// and requests are stored. The loop hands tokens to the OS selector when
/// registering file descriptors and maps readiness events back through
/// them. User code never constructs tokens directly; the typed ids
/// (`TcpId`, `TimerId`, ...) wrap them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
