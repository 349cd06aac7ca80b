//! Bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the locker and
//! minter contracts.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Locker contract on the locker chain
    #[sol(rpc)]
    contract Locker {
        /// Release previously locked tokens to `to`
        /// Reverts if `correlationId` was already processed
        function unlockToken(
            address token,
            address to,
            uint256 amount,
            bytes32 correlationId
        ) external;

        /// Release previously locked native coin to `to`
        function unlockNativeCoin(
            address to,
            uint256 amount,
            bytes32 correlationId
        ) external;

        /// Replay guard
        function processedCorrelations(bytes32 correlationId) external view returns (bool);

        event TokenLocked(
            address indexed token,
            address indexed sender,
            uint256 amount,
            bytes32 indexed txId
        );

        event NativeCoinLocked(
            address indexed sender,
            uint256 amount,
            bytes32 indexed txId
        );

        event TokenUnlocked(
            address indexed token,
            address indexed recipient,
            uint256 amount
        );

        event NativeCoinUnlocked(
            address indexed recipient,
            uint256 amount
        );
    }
}

sol! {
    /// Wrapped-asset minter on the minter chain
    #[sol(rpc)]
    contract Minter {
        /// Mint the wrapped counterpart of `originalToken` to `to`
        /// Reverts if `srcTxId` was already processed
        function mintWrapped(
            address originalToken,
            address to,
            uint256 amount,
            bytes32 srcTxId
        ) external;

        /// Mint wrapped native coin to `to`
        function mintNativeCoinWrapped(
            address to,
            uint256 amount,
            bytes32 srcTxId
        ) external;

        /// Replay guard
        function processedCorrelations(bytes32 correlationId) external view returns (bool);

        event WrappedBurned(
            address indexed wrappedToken,
            address indexed from,
            uint256 amount,
            bytes32 indexed burnId
        );

        event NativeCoinWrappedBurned(
            address indexed from,
            uint256 amount,
            bytes32 indexed burnId
        );

        event TokenMinted(
            address indexed wrappedToken,
            address indexed to,
            uint256 amount,
            bytes32 indexed srcTxId
        );

        event NativeCoinWrappedMinted(
            address indexed to,
            uint256 amount,
            bytes32 indexed srcTxId
        );
    }
}
