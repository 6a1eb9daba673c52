//! Solidity interfaces consumed by SCP.
//!
//! - [`IScpChannel`] - the settlement contract: open, deposit, read terms
//! - [`IERC20`] - balance and allowance handling for token channels

use alloy_sol_types::sol;

sol! {
    /// Settlement contract surface used by agents and hubs.
    ///
    /// Only open, deposit and the channel getter are consumed; closing and
    /// disputes are handled by watchers outside this crate.
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IScpChannel {
        struct ChannelParams {
            address participantA;
            address participantB;
            address asset;
            uint64 challengePeriodSec;
            uint64 channelExpiry;
            uint256 totalBalance;
            bool isClosing;
            uint64 closeDeadline;
            uint64 latestNonce;
        }

        event ChannelOpened(
            bytes32 indexed channelId,
            address indexed participantA,
            address indexed participantB,
            address asset,
            uint64 challengePeriodSec,
            uint64 channelExpiry
        );

        event Deposited(
            bytes32 indexed channelId,
            address indexed sender,
            uint256 amount,
            uint256 newTotalBalance
        );

        function openChannel(
            address participantB,
            address asset,
            uint256 amount,
            uint64 challengePeriodSec,
            uint64 channelExpiry,
            bytes32 salt
        ) external payable returns (bytes32 channelId);

        function deposit(bytes32 channelId, uint256 amount) external payable;

        function getChannel(bytes32 channelId) external view returns (ChannelParams memory params);
    }
}

sol! {
    /// Minimal ERC-20 interface for funding token channels.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;
    use alloy_sol_types::{SolCall, SolEvent};

    #[test]
    fn event_and_selector_signatures() {
        assert_eq!(
            IScpChannel::ChannelOpened::SIGNATURE_HASH,
            keccak256("ChannelOpened(bytes32,address,address,address,uint64,uint64)")
        );
        assert_eq!(
            IScpChannel::openChannelCall::SELECTOR,
            keccak256("openChannel(address,address,uint256,uint64,uint64,bytes32)")[..4]
        );
        assert_eq!(
            IScpChannel::getChannelCall::SELECTOR,
            keccak256("getChannel(bytes32)")[..4]
        );
    }
}
